//! Math client - pulls /math/add and receives the server's status push.
//!
//! Run `math_server` first, then:
//!
//! ```sh
//! cargo run --example math_client
//! ```

use peerwire::{Peer, PeerConfig, PushGroup};

#[tokio::main]
async fn main() -> peerwire::Result<()> {
    tracing_subscriber::fmt::init();

    let peer = Peer::new(PeerConfig::default())?;

    peer.route_push(
        PushGroup::new("/push").handler("Status", |_ctx, text: String| async move {
            println!("server status: {}", text);
            Ok(())
        }),
    )?;

    let session = peer.dial("127.0.0.1:9090").await?;
    let reply: i64 = session
        .pull("/math/add?push_status=yes", &vec![1i64, 2, 3, 4, 5])
        .await?
        .result()
        .await
        .map_err(peerwire::Error::Wire)?;

    println!("reply: {}", reply);
    peer.close().await
}
