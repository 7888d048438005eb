use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use live_alert::config::{CaptureConfig, CaptureOverrides};
use live_alert::PixelFormat;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "LIVE_ALERT_CONFIG",
        "LIVE_ALERT_WIDTH",
        "LIVE_ALERT_HEIGHT",
        "LIVE_ALERT_CAMERA_HOST",
        "LIVE_ALERT_CAMERA_USERNAME",
        "LIVE_ALERT_CAMERA_PASSWORD",
        "LIVE_ALERT_CAMERA_CHANNEL",
        "LIVE_ALERT_LOG_DIR",
        "LIVE_ALERT_SEGMENT_NAME",
        "LIVE_ALERT_LOCK_NAME",
        "LIVE_ALERT_PIXEL_FORMAT",
        "LIVE_ALERT_FRAME_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn credentials() -> CaptureOverrides {
    CaptureOverrides {
        host: Some("192.168.1.64".to_string()),
        username: Some("admin".to_string()),
        password: Some(Zeroizing::new("secret".to_string())),
        ..CaptureOverrides::default()
    }
}

#[test]
fn defaults_match_the_well_known_layout() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load(None, credentials()).expect("load config");

    assert_eq!((cfg.width, cfg.height), (640, 480));
    assert_eq!(cfg.layout().unwrap().segment_len(), 921_604);
    assert_eq!(cfg.camera.channel, 301);
    assert_eq!(cfg.log_dir, PathBuf::from("./logs"));
    assert_eq!(cfg.names.segment, "/video_stream");
    assert_eq!(cfg.names.lock, "/live_alert_mutex");
    assert_eq!(cfg.pixel_format, PixelFormat::Bgr);
    assert_eq!(cfg.timing.frame_interval, Duration::from_millis(650));
    assert_eq!(cfg.timing.error_backoff, Duration::from_secs(1));
    assert_eq!(cfg.timing.rate_log_interval, Duration::from_secs(60));
    assert!(!cfg.preview);
    assert!(!cfg.reset_stale);
}

#[test]
fn loads_config_from_file_then_env_then_cli() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "width": 800,
        "height": 600,
        "camera": {
            "host": "nvr.local",
            "username": "viewer",
            "password": "from-file",
            "channel": 101,
            "timeout_secs": 3
        },
        "log_dir": "/var/log/live-alert",
        "shm": {
            "segment_name": "/frames_dock",
            "lock_name": "/frames_dock_mutex",
            "reset_stale": true
        },
        "pixel_format": "rgb",
        "timing": {
            "frame_interval_ms": 200,
            "error_backoff_ms": 500,
            "rate_log_interval_secs": 30
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("LIVE_ALERT_CONFIG", file.path());
    std::env::set_var("LIVE_ALERT_CAMERA_PASSWORD", "from-env");
    std::env::set_var("LIVE_ALERT_HEIGHT", "720");
    std::env::set_var("LIVE_ALERT_FRAME_INTERVAL_MS", "100");

    let overrides = CaptureOverrides {
        width: Some(1280),
        preview: true,
        ..CaptureOverrides::default()
    };
    let cfg = CaptureConfig::load(None, overrides).expect("load config");

    assert_eq!(cfg.width, 1280);
    assert_eq!(cfg.height, 720);
    assert_eq!(cfg.camera.host, "nvr.local");
    assert_eq!(cfg.camera.username, "viewer");
    assert_eq!(cfg.camera.password.as_str(), "from-env");
    assert_eq!(cfg.camera.channel, 101);
    assert_eq!(cfg.camera.timeout, Duration::from_secs(3));
    assert_eq!(cfg.log_dir, PathBuf::from("/var/log/live-alert"));
    assert_eq!(cfg.names.segment, "/frames_dock");
    assert_eq!(cfg.names.lock, "/frames_dock_mutex");
    assert!(cfg.reset_stale);
    assert_eq!(cfg.pixel_format, PixelFormat::Rgb);
    assert_eq!(cfg.timing.frame_interval, Duration::from_millis(100));
    assert_eq!(cfg.timing.error_backoff, Duration::from_millis(500));
    assert_eq!(cfg.timing.rate_log_interval, Duration::from_secs(30));
    assert!(cfg.preview);

    clear_env();
}

#[test]
fn missing_credentials_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = CaptureConfig::load(None, CaptureOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("camera host is required"));

    let no_password = CaptureOverrides {
        password: None,
        ..credentials()
    };
    let err = CaptureConfig::load(None, no_password).unwrap_err();
    assert!(err.to_string().contains("password is required"));
}

#[test]
fn invalid_names_and_dimensions_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("LIVE_ALERT_SEGMENT_NAME", "video_stream");
    assert!(CaptureConfig::load(None, credentials()).is_err());

    std::env::set_var("LIVE_ALERT_SEGMENT_NAME", "/live_alert_mutex");
    let err = CaptureConfig::load(None, credentials()).unwrap_err();
    assert!(err.to_string().contains("different names"));
    std::env::remove_var("LIVE_ALERT_SEGMENT_NAME");

    let zero_width = CaptureOverrides {
        width: Some(0),
        ..credentials()
    };
    assert!(CaptureConfig::load(None, zero_width).is_err());

    std::env::set_var("LIVE_ALERT_WIDTH", "wide");
    assert!(CaptureConfig::load(None, credentials()).is_err());

    clear_env();
}

#[test]
fn unknown_file_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "widht": 800 }"#).expect("write config");

    let err = CaptureConfig::load(Some(file.path()), credentials()).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));
}

#[test]
fn debug_output_never_shows_the_password() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load(None, credentials()).expect("load config");
    let rendered = format!("{:?}", cfg);
    assert!(!rendered.contains("secret"));
}
