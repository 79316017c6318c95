use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug)]
pub enum SinkError {
    /// The provider refused this message; retrying it unchanged will not help.
    Rejected(String),
    /// The provider could not be reached.
    Unavailable(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Rejected(msg) => write!(f, "email rejected: {msg}"),
            SinkError::Unavailable(msg) => write!(f, "email provider unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Synchronous email delivery used by booking confirmations and the 24h
/// reminder. WhatsApp messages are not sent here: they are queued as
/// outbound records for an external deliverer.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_email(&self, email: &OutgoingEmail) -> Result<(), SinkError>;
}

/// Writes emails to the log. The default sink when no provider is wired in.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send_email(&self, email: &OutgoingEmail) -> Result<(), SinkError> {
        tracing::info!(to = %email.to, subject = %email.subject, "email");
        tracing::debug!("{}", email.body);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Records sent emails; addresses in `failing` are refused.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<OutgoingEmail>>,
        pub failing: Mutex<HashSet<String>>,
    }

    impl RecordingSink {
        pub fn fail_for(&self, address: &str) {
            self.failing.lock().unwrap().insert(address.to_string());
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        pub fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|e| e.to.clone()).collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send_email(&self, email: &OutgoingEmail) -> Result<(), SinkError> {
            if self.failing.lock().unwrap().contains(&email.to) {
                return Err(SinkError::Unavailable(format!("refusing {}", email.to)));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }
}
