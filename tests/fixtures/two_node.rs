//! Two-node test fixture.
//!
//! Stands up a pair of WEFT nodes on loopback: one bound and listening, one
//! dialed in, with the session already established in both directions.
//!
//! # Example
//!
//! ```no_run
//! use weft_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let mut fixture = TwoNodeFixture::new().await;
//!     // drive fixture.client / fixture.server ...
//!     fixture.cleanup();
//! }
//! ```

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use weft_core::{Multiaddr, Node, NodeConfig, NodeEvent, SessionProxy};

/// A connected client/server node pair.
pub struct TwoNodeFixture {
    /// The dialing node.
    pub client: Node,
    /// The bound node.
    pub server: Node,
    /// Event stream of the client node.
    pub client_events: UnboundedReceiver<NodeEvent>,
    /// Event stream of the server node.
    pub server_events: UnboundedReceiver<NodeEvent>,
    /// Address the server is listening on.
    pub server_addr: Multiaddr,
    /// The client's proxy for its session to the server.
    pub client_proxy: SessionProxy,
    /// The server's proxy for the inbound session.
    pub server_proxy: SessionProxy,
}

impl TwoNodeFixture {
    /// Bind a server, connect a client, and wait for the inbound session.
    ///
    /// # Panics
    ///
    /// Panics if any setup step fails; tests want a hard stop here.
    pub async fn new() -> Self {
        Self::with_config(NodeConfig::default()).await
    }

    /// Like [`new`](Self::new), with the same config applied to both nodes.
    pub async fn with_config(config: NodeConfig) -> Self {
        crate::init_tracing();

        let (server, mut server_events) = Node::new(config.clone()).expect("server node");
        server
            .bind(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .expect("bind");
        let server_addr = server
            .listening_addrs()
            .into_iter()
            .next()
            .expect("listening address");
        // Drain the bound notification so callers start from a quiet stream.
        match server_events.recv().await {
            Some(NodeEvent::Bound(_)) => {}
            other => panic!("expected bound event, got {other:?}"),
        }

        let (client, client_events) = Node::new(config).expect("client node");
        let client_proxy = client.connect(&server_addr).await.expect("connect");

        let server_proxy = loop {
            match tokio::time::timeout(Duration::from_secs(5), server_events.recv())
                .await
                .expect("inbound session event")
            {
                Some(NodeEvent::InboundSession(proxy)) => break proxy,
                Some(_) => continue,
                None => panic!("server event stream ended during setup"),
            }
        };

        Self {
            client,
            server,
            client_events,
            server_events,
            server_addr,
            client_proxy,
            server_proxy,
        }
    }

    /// Close both nodes.
    pub fn cleanup(&self) {
        self.client.close();
        self.server.close();
    }
}
