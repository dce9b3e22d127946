use std::io::Write;
use std::time::Duration;

use camstream::{Backend, Config, PixelFormat, StreamError};

// One test per binary: the environment is process-wide.
#[test]
fn environment_overrides_file_and_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[capture]\nwidth = 640\nheight = 480\n\n[stream]\nbackend = \"mock\""
    )
    .unwrap();

    std::env::set_var("CAMSTREAM__CAPTURE__WIDTH", "320");
    std::env::set_var("CAMSTREAM__STREAM__WATCHDOG_TIMEOUT_MS", "2500");
    std::env::set_var("CAMSTREAM__CAPTURE__FORMAT", "nv12");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.capture.width, 320);
    assert_eq!(config.capture.height, 480);
    assert_eq!(config.capture.format, PixelFormat::Nv12);
    assert_eq!(config.stream.backend, Backend::Mock);
    assert_eq!(
        config.stream_options().watchdog_timeout,
        Duration::from_millis(2500)
    );

    std::env::set_var("CAMSTREAM__CAPTURE__BUFFER_COUNT", "lots");
    assert!(matches!(
        Config::load(Some(file.path())),
        Err(StreamError::Config(_))
    ));

    for key in [
        "CAMSTREAM__CAPTURE__WIDTH",
        "CAMSTREAM__STREAM__WATCHDOG_TIMEOUT_MS",
        "CAMSTREAM__CAPTURE__FORMAT",
        "CAMSTREAM__CAPTURE__BUFFER_COUNT",
    ] {
        std::env::remove_var(key);
    }
}
