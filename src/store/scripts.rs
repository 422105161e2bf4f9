//! Server-side scripts backing the Redis store.
//!
//! Each script is the shared helper prelude followed by one operation body.
//! All scripts receive the same `KEYS` (see [`QueueKeys::script_keys`]) and
//! the same two leading arguments, so operation arguments start at `ARGV[3]`.
//!
//! [`QueueKeys::script_keys`]: crate::store::QueueKeys::script_keys

use redis::Script;

macro_rules! queue_script {
    ($file:literal) => {
        Script::new(concat!(
            include_str!("lua/includes.lua"),
            "\n",
            include_str!(concat!("lua/", $file))
        ))
    };
}

pub struct QueueScripts {
    pub enqueue: Script,
    pub admit: Script,
    pub finalize: Script,
    pub move_to_delayed: Script,
    pub requeue: Script,
    pub promote_delayed: Script,
    pub promote_job: Script,
    pub extend_lease: Script,
    pub reap_stalled: Script,
    pub remove: Script,
    pub pause: Script,
    pub retry: Script,
    pub update_progress: Script,
    pub add_log: Script,
    pub clean: Script,
    pub drain: Script,
    pub get_state: Script,
}

impl QueueScripts {
    pub fn load() -> Self {
        Self {
            enqueue: queue_script!("enqueue.lua"),
            admit: queue_script!("admit.lua"),
            finalize: queue_script!("finalize.lua"),
            move_to_delayed: queue_script!("move_to_delayed.lua"),
            requeue: queue_script!("requeue.lua"),
            promote_delayed: queue_script!("promote_delayed.lua"),
            promote_job: queue_script!("promote_job.lua"),
            extend_lease: queue_script!("extend_lease.lua"),
            reap_stalled: queue_script!("reap_stalled.lua"),
            remove: queue_script!("remove.lua"),
            pause: queue_script!("pause.lua"),
            retry: queue_script!("retry.lua"),
            update_progress: queue_script!("update_progress.lua"),
            add_log: queue_script!("add_log.lua"),
            clean: queue_script!("clean.lua"),
            drain: queue_script!("drain.lua"),
            get_state: queue_script!("get_state.lua"),
        }
    }
}

impl Default for QueueScripts {
    fn default() -> Self {
        Self::load()
    }
}
