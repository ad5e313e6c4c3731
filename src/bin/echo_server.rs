// Minimal Exporter demo: serves Echo.echo(String) -> String and advertises
// itself through an in-process Registry shared with `echo_client` via a
// fixed loopback port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use joyrpc::descriptor::{DescriptorBuilder, DescriptorCache, InterfaceDescriptor, MethodDescriptor};
use joyrpc::filter::FilterChain;
use joyrpc::registry::StaticRegistry;
use joyrpc::request::{Request, Response};
use joyrpc::{Exporter, ExporterConfig, ServiceImpl};
use tracing::info;

struct EchoImpl;

#[async_trait]
impl ServiceImpl for EchoImpl {
    async fn invoke(&self, request: Request) -> Response {
        Response::ok(request.id, request.args.first().cloned().unwrap_or(serde_json::json!(null)))
    }
}

struct EchoDescriptor;

impl DescriptorBuilder for EchoDescriptor {
    fn build(&self) -> InterfaceDescriptor {
        let mut methods = HashMap::new();
        methods.insert("echo".to_string(), MethodDescriptor { name: "echo".to_string(), param_types: vec!["String".to_string()] });
        InterfaceDescriptor { interface: "Echo".to_string(), alias: "default".to_string(), methods }
    }
}

#[tokio::main]
async fn main() -> joyrpc::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let config = ExporterConfig { interface: "Echo".to_string(), bind_addr: "127.0.0.1:7890".to_string(), ..Default::default() };
    let exporter = Exporter::new(
        config,
        Arc::new(StaticRegistry::new("static", vec![])),
        Arc::new(DescriptorCache::new()),
        Arc::new(EchoDescriptor),
        Arc::new(EchoImpl),
        FilterChain::new(vec![]),
    );

    exporter.open().await?;
    info!(addr = %exporter.local_addr().unwrap(), "Echo exporter listening");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    exporter.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
