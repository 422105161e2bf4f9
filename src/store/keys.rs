//! Key layout of one queue: `{prefix}:{queue}:{type}`.

/// Names of every key a queue owns. Job records live under
/// `{prefix}:{queue}:{jobId}` with `:lock` and `:logs` suffixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
    pub wait: String,
    pub paused: String,
    pub meta: String,
    pub id: String,
    pub delayed: String,
    pub priority: String,
    pub active: String,
    pub completed: String,
    pub failed: String,
    pub stalled: String,
    pub stalled_check: String,
    pub limiter: String,
    pub events: String,
    pub repeat: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}:", prefix, queue);
        let key = |kind: &str| format!("{}{}", base, kind);
        Self {
            wait: key("wait"),
            paused: key("paused"),
            meta: key("meta"),
            id: key("id"),
            delayed: key("delayed"),
            priority: key("priority"),
            active: key("active"),
            completed: key("completed"),
            failed: key("failed"),
            stalled: key("stalled"),
            stalled_check: key("stalled-check"),
            limiter: key("limiter"),
            events: key("events"),
            repeat: key("repeat"),
            base,
        }
    }

    /// `{prefix}:{queue}:` used to derive job keys inside scripts.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.base, job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}{}:lock", self.base, job_id)
    }

    pub fn logs(&self, job_id: &str) -> String {
        format!("{}{}:logs", self.base, job_id)
    }

    /// Fixed key order every script receives as `KEYS`.
    pub fn script_keys(&self) -> [&str; 14] {
        [
            self.wait.as_str(),
            self.paused.as_str(),
            self.meta.as_str(),
            self.id.as_str(),
            self.delayed.as_str(),
            self.priority.as_str(),
            self.active.as_str(),
            self.completed.as_str(),
            self.failed.as_str(),
            self.stalled.as_str(),
            self.stalled_check.as_str(),
            self.limiter.as_str(),
            self.events.as_str(),
            self.repeat.as_str(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("jobline", "mail");
        assert_eq!(keys.wait, "jobline:mail:wait");
        assert_eq!(keys.stalled_check, "jobline:mail:stalled-check");
        assert_eq!(keys.job("12"), "jobline:mail:12");
        assert_eq!(keys.lock("12"), "jobline:mail:12:lock");
        assert_eq!(keys.logs("12"), "jobline:mail:12:logs");
        assert_eq!(keys.script_keys()[12], "jobline:mail:events");
    }
}
