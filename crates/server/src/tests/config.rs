use std::env;
use std::path::Path;

use eyre::Result as EyreResult;

use super::*;

#[test]
fn test_defaults() {
    let config = ServerConfig::default();

    assert_eq!(config.listen.port(), DEFAULT_PORT);
    assert!(config.tls.is_none(), "no certificate by default");
    assert!(!config.web.enabled, "web rpc is opt in");
    assert_eq!(config.prefix_timeout, DEFAULT_PREFIX_TIMEOUT);
}

#[test]
fn test_from_file() -> EyreResult<()> {
    let path = env::temp_dir().join(format!("mixcomms-server-{}.toml", std::process::id()));
    fs::write(
        &path,
        r#"
listen = "127.0.0.1:9000"
default_domains = ["mixcomms.io"]

[tls]
certificate = "node.crt"
private_key = "node.key"

[web]
enabled = true

[prefix_timeout]
secs = 3
nanos = 0
"#,
    )?;

    let config = ServerConfig::from_file(&path);
    fs::remove_file(&path)?;
    let config = config?;

    assert_eq!(config.listen, "127.0.0.1:9000".parse::<SocketAddr>()?);
    assert_eq!(config.default_domains, ["mixcomms.io"]);
    assert_eq!(
        config.tls.as_ref().map(|tls| tls.certificate.as_path()),
        Some(Path::new("node.crt"))
    );
    assert!(config.web.enabled, "web enabled");
    assert!(config.web.tls.is_none(), "web reuses the native certificate");
    assert_eq!(config.prefix_timeout, Duration::from_secs(3));

    Ok(())
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(
        ServerConfig::from_file("/nonexistent/mixcomms-server.toml").is_err(),
        "missing file"
    );
}

#[test]
fn test_pem_pair_debug_hides_key() -> EyreResult<()> {
    let testdata = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata");
    let pair = PemPaths::new(testdata.join("node.crt"), testdata.join("node.key")).load()?;

    let debug = format!("{pair:?}");
    assert!(!debug.contains("PRIVATE KEY"), "{debug}");

    Ok(())
}
