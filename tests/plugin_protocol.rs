use std::time::Duration;

use cluster::driver::serve::DriverHandler;
use cluster::driver::{BaseDriver, Driver, NoneDriver, SshDriver};
use machine_rpc::{Client, Request, RpcError, ServeOptions};
use tokio::task::JoinHandle;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves `driver` on one end of an in-memory pipe and returns a client
/// for the other end.
fn plugin(driver: Driver, opts: ServeOptions) -> (Client, JoinHandle<Result<(), RpcError>>) {
    let (host, guest) = tokio::io::duplex(64 * 1024);
    let (guest_read, guest_write) = tokio::io::split(guest);
    let server = tokio::spawn(async move {
        let mut handler = DriverHandler::new(driver);
        machine_rpc::serve(guest_read, guest_write, &mut handler, opts).await
    });
    let (host_read, host_write) = tokio::io::split(host);
    (Client::new(host_read, host_write), server)
}

fn ssh_driver(ip: &str) -> Driver {
    let mut d = SshDriver::new(BaseDriver::new("remote", "/home/u/.minikube"));
    d.base.ip_address = ip.to_string();
    Driver::Ssh(d)
}

#[tokio::test]
async fn queries_cross_the_pipe() {
    let (client, server) = plugin(ssh_driver("10.0.0.7"), ServeOptions::default());

    let name: String = client.call(Request::DriverName, CALL_TIMEOUT).await.expect("name");
    assert_eq!(name, "ssh");
    let ip: String = client.call(Request::GetIp, CALL_TIMEOUT).await.expect("ip");
    assert_eq!(ip, "10.0.0.7");
    let port: u16 = client.call(Request::GetSshPort, CALL_TIMEOUT).await.expect("port");
    assert_eq!(port, 22);
    let user: String = client.call(Request::GetSshUsername, CALL_TIMEOUT).await.expect("user");
    assert_eq!(user, "docker");
    client.call_unit(Request::Heartbeat, CALL_TIMEOUT).await.expect("heartbeat");

    drop(client);
    server.await.expect("join").expect("server exits cleanly when the host hangs up");
}

#[tokio::test]
async fn raw_config_survives_a_round_trip() {
    let (client, _server) = plugin(ssh_driver(""), ServeOptions::default());
    let raw = serde_json::json!({
        "MachineName": "m02",
        "StorePath": "/s",
        "IPAddress": "192.168.39.4",
        "SSHUser": "core",
        "SSHPort": 2222,
    });
    client
        .call_unit(Request::SetConfigRaw { config: raw }, CALL_TIMEOUT)
        .await
        .expect("set config");

    let machine: String = client.call(Request::GetMachineName, CALL_TIMEOUT).await.expect("machine");
    assert_eq!(machine, "m02");
    let host: String = client.call(Request::GetSshHostname, CALL_TIMEOUT).await.expect("hostname");
    assert_eq!(host, "192.168.39.4");
    let config: serde_json::Value = client.call(Request::GetConfigRaw, CALL_TIMEOUT).await.expect("config");
    assert_eq!(config["SSHUser"], "core");
    assert_eq!(config["SSHPort"], 2222);
}

#[tokio::test]
async fn driver_errors_come_back_as_remote_errors() {
    let (client, _server) = plugin(Driver::None(NoneDriver::new(BaseDriver::default())), ServeOptions::default());

    let err = client
        .call::<String>(Request::GetSshUsername, CALL_TIMEOUT)
        .await
        .expect_err("the none driver has no ssh");
    assert!(err.is_remote(), "unexpected error {:?}", err);
    assert!(err.to_string().contains("does not support ssh"));

    // A driver error leaves the channel usable.
    assert!(!client.is_broken());
    let name: String = client.call(Request::DriverName, CALL_TIMEOUT).await.expect("name");
    assert_eq!(name, "none");
}

#[tokio::test]
async fn plugins_exit_without_heartbeats() {
    let opts = ServeOptions {
        heartbeat_timeout: Some(Duration::from_millis(100)),
    };
    let (client, server) = plugin(ssh_driver("10.0.0.7"), opts);

    let res = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server gave up")
        .expect("join");
    assert!(matches!(res, Err(RpcError::HeartbeatTimeout(_))), "got {:?}", res);

    let err = client
        .call::<String>(Request::GetIp, CALL_TIMEOUT)
        .await
        .expect_err("nobody is listening");
    assert!(!err.is_remote());
    assert!(client.is_broken());
}
