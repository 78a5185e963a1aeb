use fleet_types::models::Notification;

/// Decides which notifications the current user should see, by company and role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationFilter {
    /// Company of the signed-in user; `None` accepts every company
    pub company_id: Option<String>,
    /// Roles of the signed-in user
    pub roles: Vec<String>,
}

impl NotificationFilter {
    pub fn new(company_id: Option<String>, roles: Vec<String>) -> Self {
        Self { company_id, roles }
    }

    pub fn should_show(&self, notification: &Notification) -> bool {
        if let (Some(mine), Some(theirs)) = (&self.company_id, &notification.company_id)
            && mine != theirs
        {
            return false;
        }

        notification.target_roles.is_empty() || notification.target_roles.iter().any(|role| self.roles.iter().any(|mine| mine.eq_ignore_ascii_case(role)))
    }
}

/// Receives every new notification that passed the filter, e.g. to raise a desktop alert
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: &Notification);
}

/// Logs notifications through tracing
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: &Notification) {
        tracing::info!("[{:?}] {}: {}", notification.severity, notification.title, notification.message);
    }
}
