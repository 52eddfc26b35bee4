//! Connection handler used by the comparison driver

use tracing::{debug, warn};

use crate::comptool::log::{lock_log, RejectRecord, SharedLog};
use crate::network::peer::{DisconnectReason, Outbox, PeerHandler};
use crate::network::protocol::{ProtocolMessage, MSG_BLOCK, MSG_TX};

/// Serves delivered objects back to the node and records its answers
pub struct ComparisonHandler {
    log: SharedLog,
}

impl ComparisonHandler {
    pub fn new(log: SharedLog) -> Self {
        Self { log }
    }
}

impl PeerHandler for ComparisonHandler {
    fn on_message(&mut self, outbox: &mut Outbox, message: &ProtocolMessage) {
        let mut log = lock_log(&self.log);
        match message {
            ProtocolMessage::GetData(items) => {
                log.getdata.extend_from_slice(items);
                let mut missing = Vec::new();
                for item in items {
                    let reply = match item.inv_type {
                        MSG_BLOCK => log.store.block(&item.hash).cloned().map(ProtocolMessage::Block),
                        MSG_TX => log.store.tx(&item.hash).cloned().map(ProtocolMessage::Tx),
                        _ => None,
                    };
                    match reply {
                        Some(reply) => outbox.push(reply),
                        None => missing.push(*item),
                    }
                }
                if !missing.is_empty() {
                    debug!("node asked for {} unknown objects", missing.len());
                    outbox.push(ProtocolMessage::NotFound(missing));
                }
            }
            ProtocolMessage::GetHeaders(request) => {
                log.getheaders += 1;
                let headers = log
                    .store
                    .headers_for(&request.block_locator_hashes, &request.hash_stop);
                if !headers.is_empty() {
                    outbox.push(ProtocolMessage::Headers(headers));
                }
            }
            ProtocolMessage::Reject(reject) => {
                let record = RejectRecord::from_message(reject);
                debug!("node rejected {} {:?}: {}", record.message, record.hash, record);
                log.rejects.push(record);
            }
            ProtocolMessage::Inv(items) => log.inv.extend_from_slice(items),
            ProtocolMessage::Pong(nonce) => log.pongs.push(*nonce),
            _ => {}
        }
    }

    fn on_disconnect(&mut self, reason: &DisconnectReason) {
        warn!("comparison connection lost: {}", reason);
        lock_log(&self.log).disconnected = Some(reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{build_block, create_coinbase, Hash256, COIN};
    use crate::comptool::instance::Payload;
    use crate::comptool::log::new_shared_log;
    use crate::network::protocol::{GetHeadersMessage, InventoryItem, RejectCode, RejectMessage};

    fn run(handler: &mut ComparisonHandler, message: ProtocolMessage) -> Vec<ProtocolMessage> {
        let mut outbox = Outbox::default();
        handler.on_message(&mut outbox, &message);
        outbox.into_messages()
    }

    #[test]
    fn test_serves_getdata_and_notfound() {
        let log = new_shared_log();
        let tx = create_coinbase(1, COIN);
        let block = build_block(Hash256::ZERO, vec![create_coinbase(2, COIN)], 5);
        {
            let mut guard = lock_log(&log);
            guard.store.add(&Payload::Tx(tx.clone()));
            guard.store.add(&Payload::Block(block.clone()));
        }
        let mut handler = ComparisonHandler::new(log.clone());

        let unknown = InventoryItem::tx(Hash256([9u8; 32]));
        let replies = run(
            &mut handler,
            ProtocolMessage::GetData(vec![
                InventoryItem::block(block.hash()),
                InventoryItem::tx(tx.txid()),
                unknown,
            ]),
        );
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], ProtocolMessage::Block(block.clone()));
        assert_eq!(replies[1], ProtocolMessage::Tx(tx));
        assert_eq!(replies[2], ProtocolMessage::NotFound(vec![unknown]));
        assert!(lock_log(&log).requested(&block.hash()));
    }

    #[test]
    fn test_records_reject_pong_and_headers_requests() {
        let log = new_shared_log();
        let block = build_block(Hash256::ZERO, vec![create_coinbase(1, COIN)], 5);
        lock_log(&log).store.add(&Payload::Block(block.clone()));
        let mut handler = ComparisonHandler::new(log.clone());

        run(
            &mut handler,
            ProtocolMessage::Reject(RejectMessage {
                message: "block".to_string(),
                code: RejectCode::Invalid,
                reason: "bad-txnmrklroot".to_string(),
                data: Some(block.hash()),
            }),
        );
        run(&mut handler, ProtocolMessage::Pong(11));
        let replies = run(
            &mut handler,
            ProtocolMessage::GetHeaders(GetHeadersMessage {
                version: 70015,
                block_locator_hashes: vec![Hash256::ZERO],
                hash_stop: Hash256::ZERO,
            }),
        );
        assert_eq!(replies, vec![ProtocolMessage::Headers(vec![*block.header()])]);

        handler.on_disconnect(&DisconnectReason::RemoteClosed);

        let guard = lock_log(&log);
        assert_eq!(guard.reject_for(&block.hash()).unwrap().reason, "bad-txnmrklroot");
        assert!(guard.has_pong(11));
        assert_eq!(guard.request_count(), 1);
        assert_eq!(guard.disconnected, Some(DisconnectReason::RemoteClosed));
    }
}
