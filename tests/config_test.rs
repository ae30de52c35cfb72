use std::sync::Mutex;
use std::time::Duration;

use nfp_controller::config::Config;
use nfp_controller::engine::LbPolicy;
use nfp_controller::error::Error;

// Tests in this file mutate the process environment.
static ENV: Mutex<()> = Mutex::new(());

const VARS: &[&str] = &[
    "NFP_WORKERS",
    "NFP_LB_POLICY",
    "NFP_POLL_INTERVAL_SECS",
    "NFP_REPORT_INTERVAL_SECS",
    "NFP_WORKER_CONCURRENCY",
    "NFP_QUEUE_POLL_TIMEOUT_MS",
    "NFP_POLL_INBOX_CAPACITY",
    "NFP_MODULES_FILE",
];

fn clear() {
    for var in VARS {
        unsafe { std::env::remove_var(var) };
    }
}

#[test]
fn config_from_env_uses_defaults() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear();

    let config = Config::from_env().unwrap();
    assert!(config.workers >= 2);
    assert_eq!(config.lb_policy, LbPolicy::StickyRoundRobin);
    assert_eq!(config.poll_interval, Duration::from_secs(1));
    assert_eq!(config.report_interval, Duration::from_secs(10));
    assert!(config.modules_file.is_none());
    assert!(!config.log_level.is_empty());
}

#[test]
fn config_from_env_reads_overrides() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear();
    unsafe {
        std::env::set_var("NFP_WORKERS", "3");
        std::env::set_var("NFP_LB_POLICY", "round_robin");
        std::env::set_var("NFP_POLL_INTERVAL_SECS", "2");
        std::env::set_var("NFP_QUEUE_POLL_TIMEOUT_MS", "25");
        std::env::set_var("NFP_MODULES_FILE", "/etc/nfp/modules.toml");
        std::env::set_var("NFP_POLL_INBOX_CAPACITY", "");
    }

    let config = Config::from_env().unwrap();
    clear();

    assert_eq!(config.workers, 3);
    assert_eq!(config.lb_policy, LbPolicy::RoundRobin);
    assert_eq!(config.poll_interval, Duration::from_secs(2));
    assert_eq!(config.queue_poll_timeout, Duration::from_millis(25));
    assert_eq!(config.poll_inbox_capacity, 1024);
    assert_eq!(
        config.modules_file.as_deref(),
        Some(std::path::Path::new("/etc/nfp/modules.toml"))
    );

    let engine = config.controller_config();
    assert_eq!(engine.workers, 3);
    assert_eq!(engine.lb_policy, LbPolicy::RoundRobin);
}

#[test]
fn config_from_env_rejects_malformed_values() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear();
    unsafe { std::env::set_var("NFP_WORKERS", "many") };
    let result = Config::from_env();
    clear();
    assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("NFP_WORKERS")));

    unsafe { std::env::set_var("NFP_LB_POLICY", "least_connections") };
    let result = Config::from_env();
    clear();
    assert!(matches!(result, Err(Error::Config(_))));
}
