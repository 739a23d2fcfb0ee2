use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::net::{DhtNetwork, FindValueReply};
use crate::node::DhtNode;
use crate::protocol::{salvage_rpc_id, Message, MessageKind, MAX_DATAGRAM_SIZE};

/// Receive datagrams on `socket` forever, answering each in its own task.
///
/// Receive errors are logged and the loop keeps going; a peer that vanished
/// between request and reply must not take the listener down.
pub async fn serve<N: DhtNetwork>(node: Arc<DhtNode<N>>, socket: Arc<UdpSocket>) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("receive failed: {err}");
                continue;
            }
        };
        let datagram = buf[..len].to_vec();
        let node = node.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Err(err) = answer(&node, &socket, &datagram, remote).await {
                debug!(%remote, "failed to answer datagram: {err}");
            }
        });
    }
}

async fn answer<N: DhtNetwork>(
    node: &DhtNode<N>,
    socket: &UdpSocket,
    datagram: &[u8],
    remote: SocketAddr,
) -> Result<()> {
    let Some(reply) = handle_datagram(node, datagram).await else {
        return Ok(());
    };
    let mut bytes = reply.encode()?;
    bytes.push(b'\n');
    socket.send_to(&bytes, remote).await?;
    Ok(())
}

/// Decode one inbound datagram and produce the reply, if any.
///
/// Undecodable payloads and unknown message kinds are answered with `ERROR`.
/// Only requests are answered: a reply kind (`PONG`, `ERROR`, the `FOUND_*`
/// kinds, `STORE_RESPONSE`) arriving here has no pending request to match and
/// is dropped without touching the routing table, so two listeners never
/// answer each other's answers. A request first updates the routing table with
/// its sender, then is dispatched.
pub async fn handle_datagram<N: DhtNetwork>(
    node: &DhtNode<N>,
    datagram: &[u8],
) -> Option<Message> {
    let me = node.self_contact.clone();
    let message = match Message::decode(datagram) {
        Ok(message) => message,
        Err(err) => {
            debug!("rejecting malformed datagram: {err}");
            return Some(Message {
                kind: MessageKind::Error,
                from: me,
                rpc_id: salvage_rpc_id(datagram),
            });
        }
    };
    trace!(
        kind = message.kind.name(),
        peer = %message.from.id,
        "handling message"
    );

    if !message.kind.is_request() {
        debug!(
            kind = message.kind.name(),
            peer = %message.from.id,
            "dropping unsolicited reply"
        );
        return None;
    }
    node.observe_contact(message.from.clone()).await;

    let kind = match &message.kind {
        MessageKind::Ping => MessageKind::Pong,
        MessageKind::FindNode { target } => MessageKind::FoundContacts {
            contacts: node.handle_find_node_request(target).await,
        },
        MessageKind::FindData { key } => match node.handle_find_value_request(key).await {
            FindValueReply::Value(value) => MessageKind::FoundData {
                contacts: Vec::new(),
                value: Some(value),
            },
            FindValueReply::Contacts(contacts) => MessageKind::FoundData {
                contacts,
                value: None,
            },
        },
        MessageKind::Store { key, value } => MessageKind::StoreResponse {
            store_success: node
                .handle_store_request(&message.from, *key, value.clone())
                .await,
        },
        // Filtered out above.
        MessageKind::Pong
        | MessageKind::StoreResponse { .. }
        | MessageKind::FoundContacts { .. }
        | MessageKind::FoundData { .. }
        | MessageKind::Error => return None,
    };
    Some(message.reply(me, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtParams;
    use crate::events::TracingSink;
    use crate::id::{hash_content, NodeId};
    use crate::net::UdpNetwork;
    use crate::routing::Contact;

    fn node() -> DhtNode<UdpNetwork> {
        let me = Contact::new(NodeId::random(), "127.0.0.1:4100".parse().expect("addr"));
        let network = UdpNetwork::new(me.clone(), DhtParams::default().rpc_timeout);
        DhtNode::new(me, network, DhtParams::default(), Arc::new(TracingSink))
    }

    fn peer() -> Contact {
        Contact::new(NodeId::random(), "127.0.0.1:4101".parse().expect("addr"))
    }

    fn encode(kind: MessageKind, from: Contact) -> (Message, Vec<u8>) {
        let msg = Message::request(from, kind);
        let bytes = msg.encode().expect("encode");
        (msg, bytes)
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_and_sender_recorded() {
        let node = node();
        let from = peer();
        let (request, bytes) = encode(MessageKind::Ping, from.clone());

        let reply = handle_datagram(&node, &bytes).await.expect("requests are answered");
        assert_eq!(reply.kind, MessageKind::Pong);
        assert_eq!(reply.rpc_id, request.rpc_id);
        assert_eq!(reply.from.id, node.id());
        assert!(node.routing_contacts().await.iter().any(|c| c.id == from.id));
    }

    #[tokio::test]
    async fn replies_are_never_answered() {
        let node = node();
        let unsolicited = [
            MessageKind::Pong,
            MessageKind::Error,
            MessageKind::StoreResponse {
                store_success: true,
            },
            MessageKind::FoundContacts {
                contacts: vec![peer()],
            },
            MessageKind::FoundData {
                contacts: Vec::new(),
                value: Some("stray".into()),
            },
        ];
        for kind in unsolicited {
            let name = kind.name();
            let (_, bytes) = encode(kind, peer());
            assert!(
                handle_datagram(&node, &bytes).await.is_none(),
                "{name} must not be answered"
            );
        }
        assert!(node.routing_contacts().await.is_empty());
    }

    #[tokio::test]
    async fn error_reply_to_garbage_is_not_answered_in_turn() {
        let node = node();
        let error = handle_datagram(&node, b"not json")
            .await
            .expect("garbage is answered");
        let bytes = error.encode().expect("encode");
        assert!(handle_datagram(&node, &bytes).await.is_none());
    }

    #[tokio::test]
    async fn store_then_find_data_returns_value() {
        let node = node();
        let from = peer();
        let key = hash_content(b"stored");
        let (_, bytes) = encode(
            MessageKind::Store {
                key,
                value: "stored".into(),
            },
            from.clone(),
        );
        let reply = handle_datagram(&node, &bytes).await.expect("requests are answered");
        assert_eq!(
            reply.kind,
            MessageKind::StoreResponse {
                store_success: true
            }
        );

        let (_, bytes) = encode(MessageKind::FindData { key }, from);
        let reply = handle_datagram(&node, &bytes).await.expect("requests are answered");
        assert_eq!(
            reply.kind,
            MessageKind::FoundData {
                contacts: Vec::new(),
                value: Some("stored".into())
            }
        );
    }

    #[tokio::test]
    async fn store_with_wrong_key_is_refused() {
        let node = node();
        let (_, bytes) = encode(
            MessageKind::Store {
                key: hash_content(b"something else"),
                value: "stored".into(),
            },
            peer(),
        );
        let reply = handle_datagram(&node, &bytes).await.expect("requests are answered");
        assert_eq!(
            reply.kind,
            MessageKind::StoreResponse {
                store_success: false
            }
        );
    }

    #[tokio::test]
    async fn find_data_miss_falls_back_to_contacts() {
        let node = node();
        let from = peer();
        let (_, bytes) = encode(
            MessageKind::FindData {
                key: hash_content(b"absent"),
            },
            from.clone(),
        );
        let reply = handle_datagram(&node, &bytes).await.expect("requests are answered");
        match reply.kind {
            MessageKind::FoundData { contacts, value } => {
                assert!(value.is_none());
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].id, from.id);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_is_answered_with_error() {
        let node = node();
        let reply = handle_datagram(&node, b"{\"messageType\":\"NOPE\",\"rpcId\":9}")
            .await
            .expect("garbage is answered");
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.rpc_id, 9);

        let reply = handle_datagram(&node, b"\xff\xfe")
            .await
            .expect("garbage is answered");
        assert_eq!(reply.kind, MessageKind::Error);
    }
}
