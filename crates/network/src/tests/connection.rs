use eyre::Result as EyreResult;
use tokio::net::TcpListener;

use super::*;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn test_alive_states() {
    assert!(ConnectivityState::Idle.is_alive());
    assert!(ConnectivityState::Connecting.is_alive());
    assert!(ConnectivityState::Ready.is_alive());
    assert!(!ConnectivityState::TransientFailure.is_alive());
    assert!(!ConnectivityState::Shutdown.is_alive());
}

#[tokio::test]
async fn test_dial_refused_is_connection_class() -> EyreResult<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    drop(listener);

    let target = DialTarget {
        address: &address,
        credentials: None,
        timeout: DIAL_TIMEOUT,
    };
    let err = Connection::dial(ConnectionType::Native, target)
        .await
        .unwrap_err();

    assert_eq!(err.class(), crate::ErrorClass::Connection, "{err}");

    Ok(())
}

#[tokio::test]
async fn test_web_connection_lifecycle() -> EyreResult<()> {
    // Never accepted, so the peer neither answers nor hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();

    let target = DialTarget {
        address: &address,
        credentials: None,
        timeout: DIAL_TIMEOUT,
    };
    let connection = Connection::dial(ConnectionType::Web, target).await?;

    assert_eq!(connection.kind(), ConnectionType::Web);
    assert!(connection.is_alive(), "freshly dialed connection is alive");
    assert!(connection.channel().auth().is_none(), "no auth by default");

    connection.close();

    assert_eq!(connection.state(), ConnectivityState::Shutdown);
    assert!(!connection.is_alive(), "closed connection is not alive");

    drop(listener);

    Ok(())
}

#[tokio::test]
#[should_panic = "web connection used as a native rpc connection"]
async fn test_native_handle_from_web_connection_panics() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let target = DialTarget {
        address: &address,
        credentials: None,
        timeout: DIAL_TIMEOUT,
    };
    let connection = Connection::dial(ConnectionType::Web, target).await.unwrap();

    let _native = connection.native();
}

#[test]
fn test_http_status_mapping() -> EyreResult<()> {
    let response = Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .body(())?;
    assert_eq!(
        check_response_head(&response).map_err(|status| status.code()),
        Err(Code::Unavailable)
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("grpc-status", "16")
        .header("grpc-message", "failed to authenticate id: x")
        .body(())?;
    let status = check_response_head(&response).unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(status.message(), "failed to authenticate id: x");

    let response = Response::builder().status(StatusCode::OK).body(())?;
    assert_eq!(check_response_head(&response), Ok(()));

    Ok(())
}
