use machine_rpc::{Handler, Request, ServeOptions};
use serde_json::{json, Value};
use tracing::info;

use super::{BaseDriver, Driver, DriverCapability, Family, KicDriver, NoneDriver, SshDriver};
use crate::config::{ClusterConfig, Node};

/// Answers plugin calls with an in-process driver.
pub struct DriverHandler {
    driver: Driver,
}

impl DriverHandler {
    pub fn new(driver: Driver) -> Self {
        DriverHandler { driver }
    }

    async fn dispatch(&mut self, request: Request) -> anyhow::Result<Value> {
        let d = &mut self.driver;
        Ok(match request {
            Request::Heartbeat => Value::Null,
            Request::DriverName => json!(d.driver_name()),
            Request::GetMachineName => d.config_raw().await?["MachineName"].clone(),
            Request::PreCreateCheck => unit(d.pre_create_check().await?),
            Request::GetConfigRaw => d.config_raw().await?,
            Request::SetConfigRaw { config } => unit(d.set_config_raw(config).await?),
            Request::Create { config, node } => {
                let cc: ClusterConfig = serde_json::from_value(config)?;
                let node: Node = serde_json::from_value(node)?;
                unit(d.create(&cc, &node).await?)
            }
            Request::Start => unit(d.start().await?),
            Request::Stop => unit(d.stop().await?),
            Request::Restart => unit(d.restart().await?),
            Request::Remove => unit(d.remove().await?),
            Request::Kill => unit(d.kill().await?),
            Request::GetIp => json!(d.ip().await?),
            Request::GetSshHostname => json!(d.ssh_hostname().await?),
            Request::GetSshPort => json!(d.ssh_port().await?),
            Request::GetSshKeyPath => json!(d.ssh_key_path().await?),
            Request::GetSshUsername => json!(d.ssh_username().await?),
            Request::GetState => serde_json::to_value(d.state().await?)?,
            Request::GetUrl => json!(d.url().await?),
        })
    }
}

fn unit(_: ()) -> Value {
    Value::Null
}

#[async_trait::async_trait]
impl Handler for DriverHandler {
    async fn handle(&mut self, request: Request) -> Result<Value, String> {
        self.dispatch(request).await.map_err(|e| format!("{:#}", e))
    }
}

/// Serves the built-in driver `name` over stdio until the host goes away.
pub async fn serve_plugin(name: &str) -> anyhow::Result<()> {
    let def = super::lookup(name).ok_or_else(|| super::DriverError::NotFound(name.to_string()))?;
    let base = BaseDriver::default();
    let driver = match def.family {
        Family::BareMetal => Driver::None(NoneDriver::new(base)),
        Family::Ssh => Driver::Ssh(SshDriver::new(base)),
        Family::Kic => Driver::Kic(KicDriver::new(base, def.name)),
        Family::Vm => anyhow::bail!("the {} driver is not built into minikube", name),
    };
    info!(driver = name, "serving driver plugin");
    let mut handler = DriverHandler::new(driver);
    machine_rpc::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        &mut handler,
        ServeOptions::default(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn answers_queries_from_the_driver() {
        let mut d = SshDriver::new(BaseDriver::new("remote", "/home/u/.minikube"));
        d.base.ip_address = "10.0.0.7".to_string();
        let mut h = DriverHandler::new(Driver::Ssh(d));

        assert_eq!(h.handle(Request::DriverName).await, Ok(json!("ssh")));
        assert_eq!(h.handle(Request::GetIp).await, Ok(json!("10.0.0.7")));
        assert_eq!(h.handle(Request::GetSshPort).await, Ok(json!(22)));
        assert_eq!(h.handle(Request::GetMachineName).await, Ok(json!("remote")));
        assert_eq!(h.handle(Request::Heartbeat).await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn errors_are_strings() {
        let mut h = DriverHandler::new(Driver::None(NoneDriver::new(BaseDriver::default())));
        let err = h
            .handle(Request::GetSshUsername)
            .await
            .expect_err("none has no ssh");
        assert!(err.contains("does not support ssh"));
    }

    #[tokio::test]
    async fn raw_config_round_trips_through_the_handler() {
        let mut h = DriverHandler::new(Driver::Ssh(SshDriver::new(BaseDriver::default())));
        let raw = json!({"MachineName": "m", "StorePath": "/s", "IPAddress": "1.2.3.4", "SSHPort": 2200});
        h.handle(Request::SetConfigRaw { config: raw })
            .await
            .expect("set");
        assert_eq!(h.handle(Request::GetSshPort).await, Ok(json!(2200)));
        assert_eq!(h.handle(Request::GetSshHostname).await, Ok(json!("1.2.3.4")));
    }
}
