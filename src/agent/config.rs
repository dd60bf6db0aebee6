// src/agent/config.rs

use std::env;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub socket_path: String,
    pub modules_dir: String,
    /// Peer UID allowed on the socket besides root.
    pub expected_caller_uid: u32,
    /// "magisk" or "kernelsu"; unset means probe for ksud.
    pub platform_override: Option<String>,
}

impl AgentConfig {
    pub fn load() -> Self {
        // The UID is parsed strictly. A non-numeric value in the environment
        // would leave the peer-credential check comparing against garbage,
        // so the daemon refuses to start instead.
        let expected_caller_uid = env::var("ROOTMOD_CALLER_UID")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u32>()
            .expect("ROOTMOD_CALLER_UID must be a valid numeric User ID");

        Self {
            socket_path: env::var("ROOTMOD_SOCKET_PATH")
                .unwrap_or_else(|_| "/data/adb/rootmod/daemon.sock".to_string()),

            modules_dir: env::var("ROOTMOD_MODULES_DIR")
                .unwrap_or_else(|_| "/data/adb/modules".to_string()),

            expected_caller_uid,

            platform_override: env::var("ROOTMOD_PLATFORM").ok(),
        }
    }
}
