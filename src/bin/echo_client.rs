// Minimal Refer demo: calls Echo.echo(String) against `echo_server` running
// on the loopback port it advertises.

use std::sync::Arc;
use std::time::Duration;

use joyrpc::channel_manager::ChannelManager;
use joyrpc::codec::LengthPrefixedJsonCodec;
use joyrpc::filter::FilterChain;
use joyrpc::loadbalance::RoundRobinBalance;
use joyrpc::node::Node;
use joyrpc::registry::StaticRegistry;
use joyrpc::request::Outcome;
use joyrpc::route::Route;
use joyrpc::timing_wheel::TimingWheel;
use joyrpc::transport::TcpConnector;
use joyrpc::url::Url;
use joyrpc::{Refer, ReferConfig, Request};
use tracing::info;

#[tokio::main]
async fn main() -> joyrpc::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let node = Node::new(Url::new("tcp", "127.0.0.1", 7890, "Echo"), Duration::from_millis(0));
    let registry = Arc::new(StaticRegistry::new("static", vec![node]));

    let wheel = Arc::new(TimingWheel::new(Duration::from_millis(10), 256));
    let manager = Arc::new(ChannelManager::new(Arc::new(TcpConnector), Arc::new(LengthPrefixedJsonCodec), 4 << 20, wheel));
    let route = Route::new(Arc::new(RoundRobinBalance::default()));
    let config = ReferConfig { interface: "Echo".to_string(), ..Default::default() };
    let refer = Refer::new(config, registry, manager, route, FilterChain::new(vec![]));

    refer.open().await?;
    // `connect_on_add` dials in the background; give the node a moment to
    // reach `Connected` before the first invoke.
    for _ in 0..50 {
        if !refer.cluster().view().admissible().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = refer.invoke(Request::new("Echo", "echo", vec![serde_json::json!("hello from echo_client")])).await?;
    match response.outcome {
        Outcome::Ok(value) => info!(%value, "echo reply"),
        Outcome::RemoteError { message, .. } => info!(%message, "echo failed"),
    }

    refer.close().await;
    Ok(())
}
