use std::time::Duration;

use secrecy::ExposeSecret;
use txqueue::config::Config;

// Env vars are process-wide; keep every case in one test so they cannot race.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("TXQ_SWEEP_INTERVAL_SECS");
        std::env::remove_var("TXQ_MAX_CONNECTIONS");
        std::env::remove_var("TXQ_LOCK_TABLE_CAPACITY");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://txq-test.db");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url.expose_secret(), "sqlite://txq-test.db");
    assert!(!config.log_level.is_empty());
    assert_eq!(config.sweep_interval, Duration::from_secs(30));
    assert_eq!(config.max_connections, 10);
    assert_eq!(config.lock_table_capacity, 1024);

    unsafe {
        std::env::set_var("TXQ_SWEEP_INTERVAL_SECS", " 5 ");
        std::env::set_var("TXQ_LOCK_TABLE_CAPACITY", "64");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.sweep_interval, Duration::from_secs(5));
    assert_eq!(config.lock_table_capacity, 64);

    unsafe {
        std::env::set_var("TXQ_SWEEP_INTERVAL_SECS", "0");
    }
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("TXQ_SWEEP_INTERVAL_SECS"), "{err}");

    unsafe {
        std::env::set_var("TXQ_SWEEP_INTERVAL_SECS", "5");
        std::env::set_var("TXQ_MAX_CONNECTIONS", "lots");
    }
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("TXQ_MAX_CONNECTIONS"), "{err}");

    // Clean up
    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("TXQ_SWEEP_INTERVAL_SECS");
        std::env::remove_var("TXQ_MAX_CONNECTIONS");
        std::env::remove_var("TXQ_LOCK_TABLE_CAPACITY");
    }
}
