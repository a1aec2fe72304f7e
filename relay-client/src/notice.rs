#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Destructive,
}

/// A dismissible message for the user about a subscription operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notice {
    fn new(title: &str, description: &str, severity: Severity) -> Self {
        Notice {
            title: title.to_string(),
            description: description.to_string(),
            severity,
        }
    }

    pub fn enabled() -> Self {
        Self::new("Notifications enabled", "You will receive reminders about your cycle", Severity::Info)
    }

    pub fn disabled() -> Self {
        Self::new("Notifications disabled", "You will no longer receive push notifications", Severity::Info)
    }

    pub fn sign_in_required() -> Self {
        Self::new("Sign in required", "Please sign in to enable notifications", Severity::Destructive)
    }

    pub fn configuration_error() -> Self {
        Self::new("Configuration error", "Push notifications are not configured", Severity::Destructive)
    }

    pub fn permission_denied() -> Self {
        Self::new(
            "Permission denied",
            "Please enable notifications in your browser settings",
            Severity::Destructive,
        )
    }

    pub fn subscription_failed() -> Self {
        Self::new(
            "Subscription failed",
            "Could not enable notifications. Please try again.",
            Severity::Destructive,
        )
    }

    pub fn error() -> Self {
        Self::new("Error", "Could not disable notifications", Severity::Destructive)
    }
}
