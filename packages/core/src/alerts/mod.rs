pub mod debounce;
pub mod publisher;
pub mod webhook;

pub use debounce::NotificationDebouncer;
pub use publisher::AlertPublisher;
pub use webhook::{AlertNotifier, LogNotifier, NotifyError, WebhookNotifier};
