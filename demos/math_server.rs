//! Math server - serves /math/add and pushes status back to the caller.
//!
//! Run with:
//!
//! ```sh
//! cargo run --example math_server
//! ```
//!
//! then start `math_client` in another terminal.

use peerwire::{Peer, PeerConfig, PullCtx, PullGroup, Status, WireError};

#[tokio::main]
async fn main() -> peerwire::Result<()> {
    tracing_subscriber::fmt::init();

    let peer = Peer::new(PeerConfig {
        listen_address: "127.0.0.1:9090".to_string(),
        count_time: true,
        ..Default::default()
    })?;

    peer.route_pull(
        PullGroup::new("/math").handler("Add", |ctx: PullCtx, args: Vec<i64>| async move {
            if ctx.query_value("push_status") == Some("yes") {
                let text = format!("numbers {:?} are being added...", args);
                ctx.session()
                    .push("/push/status", &text)
                    .await
                    .map_err(|e| WireError::with_cause(Status::INTERNAL_SERVER_ERROR, e))?;
            }
            Ok::<i64, WireError>(args.iter().sum())
        }),
    )?;

    peer.listen().await
}
