use std::future::Future;
use std::str::FromStr;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tether_coord::{Coordinator, PeerId};

use crate::error::Error;

/// Value of the `Upgrade` header on coordinate requests.
pub const UPGRADE_PROTOCOL: &str = "tether";

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/workspaceagents/:id/legacy", get(agent_legacy))
        .route("/workspaceagents/:id/coordinate", get(agent_coordinate))
        .route("/workspaceclients/:id/coordinate", get(client_coordinate))
        .route("/workspaceproxies/me/coordinate", get(proxy_coordinate))
        .with_state(coordinator)
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": crate::NAME,
        "version": crate::VERSION,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentLegacy {
    found: bool,
    legacy: bool,
}

/// Whether the agent's announced node pre-dates multi-homing. Proxies use
/// this to decide between transports. An agent that is not currently
/// connected reports `found: false`, whether or not it ever connected.
async fn agent_legacy(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> Result<Json<AgentLegacy>, Error> {
    let id = PeerId::from_str(&id)?;
    let node = coordinator.node_of(&id);

    Ok(Json(AgentLegacy {
        found: node.is_some(),
        legacy: node.map(|node| node.is_legacy()).unwrap_or(false),
    }))
}

async fn agent_coordinate(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    mut req: Request,
) -> Result<Response, Error> {
    let id = PeerId::from_str(&id)?;
    let on_upgrade = upgradable(&coordinator, &mut req)?;
    serve_upgraded(on_upgrade, move |io| async move {
        coordinator.serve_agent(io, id).await
    });

    Ok(switching_protocols())
}

#[derive(Debug, Deserialize)]
struct ClientCoordinate {
    /// Subscribe to this agent as part of connecting.
    agent: Option<String>,
}

async fn client_coordinate(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    Query(params): Query<ClientCoordinate>,
    mut req: Request,
) -> Result<Response, Error> {
    let id = PeerId::from_str(&id)?;
    let agent = params
        .agent
        .as_deref()
        .map(PeerId::from_str)
        .transpose()?;
    let on_upgrade = upgradable(&coordinator, &mut req)?;
    serve_upgraded(on_upgrade, move |io| async move {
        coordinator.serve_client(io, id, agent).await
    });

    Ok(switching_protocols())
}

#[derive(Debug, Deserialize)]
struct ProxyCoordinate {
    /// Peer id to register under; minted here when the proxy doesn't
    /// bring one.
    id: Option<String>,
}

async fn proxy_coordinate(
    State(coordinator): State<Coordinator>,
    Query(params): Query<ProxyCoordinate>,
    mut req: Request,
) -> Result<Response, Error> {
    let id = params
        .id
        .as_deref()
        .map(PeerId::from_str)
        .transpose()?
        .unwrap_or_else(PeerId::generate);
    let on_upgrade = upgradable(&coordinator, &mut req)?;
    serve_upgraded(on_upgrade, move |io| async move {
        coordinator.serve_multi_agent(io, id).await
    });

    Ok(switching_protocols())
}

/// Take the upgrade handle off the request, checking the headers and that
/// the coordinator still accepts peers.
fn upgradable(coordinator: &Coordinator, req: &mut Request) -> Result<OnUpgrade, Error> {
    if coordinator.is_closed() {
        return Err(Error::Unavailable);
    }
    let upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok());
    if upgrade != Some(UPGRADE_PROTOCOL) {
        return Err(Error::UpgradeExpected);
    }
    req.extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(Error::UpgradeExpected)
}

/// Once the 101 response is on the wire, the upgraded stream is handed to
/// the coordinator; from here on all errors surface as a closed stream.
fn serve_upgraded<F, Fut>(on_upgrade: OnUpgrade, serve: F)
where
    F: FnOnce(TokioIo<Upgraded>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), tether_coord::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if let Err(err) = serve(TokioIo::new(upgraded)).await {
                    tracing::debug!("coordinate stream ended: {err}");
                }
            }
            Err(err) => {
                tracing::debug!("connection upgrade failed: {err}");
            }
        }
    });
}

fn switching_protocols() -> Response {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Body::empty())
        .expect("response is valid")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time;
    use tower::ServiceExt as _;

    use tether_coord::node::{Key, LEGACY_AGENT_IP};
    use tether_coord::wire::frame::{self, Frame};
    use tether_coord::Node;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn node(seq: u64, legacy: bool) -> Node {
        let addresses = if legacy {
            vec![LEGACY_AGENT_IP]
        } else {
            vec!["fd7a::2".parse().unwrap()]
        };
        Node {
            seq,
            key: Key([1; 32]),
            addresses,
            endpoints: vec![],
            preferred_derp: 0,
        }
    }

    /// Connect an agent and announce a node. The returned stream keeps
    /// the agent registered for the duration of the test.
    async fn announce_agent(coordinator: &Coordinator, id: PeerId, node: Node) -> DuplexStream {
        let (mut local, remote) = tokio::io::duplex(4096);
        let seq = node.seq;
        let serve = coordinator.clone();
        tokio::spawn(async move { serve.serve_agent(remote, id).await });
        frame::handshake(&mut local, id).await.unwrap();
        frame::write(&mut local, &Frame::SelfUpdate(node))
            .await
            .unwrap();
        time::timeout(TIMEOUT, async {
            while coordinator.node_of(&id).map(|node| node.seq) != Some(seq) {
                time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        local
    }

    async fn get_legacy(coordinator: &Coordinator, id: &str) -> (StatusCode, Option<AgentLegacy>) {
        let response = router(coordinator.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/workspaceagents/{id}/legacy"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        (status, serde_json::from_slice(&body).ok())
    }

    #[tokio::test]
    async fn test_legacy_unknown_agent() {
        let coordinator = Coordinator::new();
        let id = PeerId::generate();
        let (status, body) = get_legacy(&coordinator, &id.to_string()).await;
        let body = body.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(!body.found);
        assert!(!body.legacy);
    }

    #[tokio::test]
    async fn test_legacy_invalid_id() {
        let coordinator = Coordinator::new();
        let (status, _) = get_legacy(&coordinator, "not-a-peer-id").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_legacy_connected_agent() {
        let coordinator = Coordinator::new();
        let id = PeerId::generate();
        let _agent = announce_agent(&coordinator, id, node(1, true)).await;

        let (status, body) = get_legacy(&coordinator, &id.to_string()).await;
        let body = body.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(body.found);
        assert!(body.legacy);
    }

    #[tokio::test]
    async fn test_legacy_multihomed_agent() {
        let coordinator = Coordinator::new();
        let id = PeerId::generate();
        let _agent = announce_agent(&coordinator, id, node(1, false)).await;

        let (_, body) = get_legacy(&coordinator, &id.to_string()).await;
        let body = body.unwrap();

        assert!(body.found);
        assert!(!body.legacy);
    }

    #[tokio::test]
    async fn test_coordinate_requires_upgrade_header() {
        let coordinator = Coordinator::new();
        let id = PeerId::generate();
        let response = router(coordinator)
            .oneshot(
                Request::builder()
                    .uri(format!("/workspaceagents/{id}/coordinate"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn test_agent_coordinate_upgrade() {
        let coordinator = Coordinator::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let id = PeerId::generate();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /workspaceagents/{id}/coordinate HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: {UPGRADE_PROTOCOL}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        // Read the response head; the coordinate stream starts right
        // after it.
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

        frame::handshake(&mut stream, id).await.unwrap();
        frame::write(&mut stream, &Frame::SelfUpdate(node(3, false)))
            .await
            .unwrap();

        time::timeout(TIMEOUT, async {
            while coordinator.node_of(&id).map(|node| node.seq) != Some(3) {
                time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("agent node should reach the coordinator");
    }
}
