//! Property-based tests for RoomLink
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Room Registry Properties
// ============================================================================

mod registry_properties {
    use super::*;
    use roomlink_relay::{MAX_PARTICIPANTS, ParticipantId, RoomId, RoomRegistry};

    #[derive(Debug, Clone)]
    enum Op {
        Join(u64),
        Leave(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u64..5).prop_map(Op::Join), (0u64..5).prop_map(Op::Leave)]
    }

    proptest! {
        /// Occupancy never exceeds two, never repeats a member, and joins
        /// succeed exactly when the room exists with a free slot
        #[test]
        fn occupancy_bounded(ops in prop::collection::vec(op(), 0..64)) {
            let mut registry = RoomRegistry::new();
            let room = RoomId::from("R1");
            registry.create(room.clone());

            let mut model: Vec<u64> = Vec::new();
            let mut alive = true;

            for op in ops {
                match op {
                    Op::Join(p) => {
                        let expected = alive
                            && (model.contains(&p) || model.len() < MAX_PARTICIPANTS);
                        let joined = registry.join(&room, ParticipantId::new(p));
                        prop_assert_eq!(joined, expected);
                        if expected && !model.contains(&p) {
                            model.push(p);
                        }
                    }
                    Op::Leave(p) => {
                        registry.leave(&room, ParticipantId::new(p));
                        if let Some(pos) = model.iter().position(|m| *m == p) {
                            model.remove(pos);
                            if model.is_empty() {
                                alive = false;
                            }
                        }
                    }
                }

                let members = registry.participants(&room);
                prop_assert!(members.len() <= MAX_PARTICIPANTS);
                let raw: Vec<u64> = members.iter().map(|m| m.get()).collect();
                prop_assert_eq!(&raw, &model);
                prop_assert_eq!(registry.exists(&room), alive);
            }
        }

        /// Generated ids are hex of the requested length and never collide in practice
        #[test]
        fn room_ids_are_hex(bytes in 8usize..32) {
            let a = RoomId::generate(bytes);
            let b = RoomId::generate(bytes);
            prop_assert_eq!(a.as_str().len(), bytes * 2);
            prop_assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
            prop_assert_ne!(a, b);
        }
    }
}

// ============================================================================
// Signaling Protocol Properties
// ============================================================================

mod protocol_properties {
    use super::*;
    use roomlink_relay::{ClientMessage, ServerMessage};

    proptest! {
        /// Arbitrary text never panics the parsers
        #[test]
        fn parse_arbitrary_text(text in ".{0,256}") {
            let _ = ClientMessage::from_json(&text);
            let _ = ServerMessage::from_json(&text);
        }

        /// Opaque payloads survive the relay's message types unchanged
        #[test]
        fn candidate_payload_preserved(candidate in "[a-z0-9 :.]{0,64}", mline in 0u32..8) {
            let payload = serde_json::json!({
                "candidate": candidate,
                "sdpMLineIndex": mline,
            });
            let text = ClientMessage::IceCandidate { candidate: payload.clone() }
                .to_json()
                .unwrap();
            match ClientMessage::from_json(&text).unwrap() {
                ClientMessage::IceCandidate { candidate } => prop_assert_eq!(candidate, payload),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}

// ============================================================================
// Transfer Properties
// ============================================================================

mod transfer_properties {
    use super::*;
    use async_trait::async_trait;
    use roomlink_core::transfer::progress_percent;
    use roomlink_core::{
        ChannelMessage, DataChannel, OutgoingFile, ReceiveEvent, TransferConfig,
        TransferReceiver, TransferSender, TransportError,
    };
    use std::sync::{Arc, Mutex};

    /// Channel that records every message it is asked to send
    #[derive(Default)]
    struct CollectingChannel {
        messages: Mutex<Vec<ChannelMessage>>,
    }

    #[async_trait]
    impl DataChannel for CollectingChannel {
        fn label(&self) -> &str {
            "fileTransfer"
        }

        async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            0
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Reassembled files equal the originals for any sizes and chunk size
        #[test]
        fn chunked_batch_reassembles(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..2048), 1..5),
            chunk_size in 1usize..700,
        ) {
            let channel = Arc::new(CollectingChannel::default());
            let config = TransferConfig {
                chunk_size,
                ..TransferConfig::default()
            };
            let files: Vec<_> = bodies
                .iter()
                .enumerate()
                .map(|(i, body)| OutgoingFile::from_bytes(format!("f{i}"), "", body.clone()))
                .collect();

            let sender = TransferSender::new(channel.clone(), config);
            let mut sender_percent: Vec<Vec<u8>> = vec![Vec::new(); bodies.len()];
            let summary = runtime()
                .block_on(sender.send_batch(files, |p| sender_percent[p.index].push(p.percent)))
                .unwrap();
            prop_assert_eq!(summary.files, bodies.len());

            let messages = std::mem::take(&mut *channel.messages.lock().unwrap());
            for (body, percents) in bodies.iter().zip(&sender_percent) {
                prop_assert_eq!(percents.last().copied(), Some(100));
                prop_assert!(percents.windows(2).all(|w| w[0] <= w[1]));
                let chunks = body.len().div_ceil(chunk_size).max(1);
                prop_assert_eq!(percents.len(), chunks);
            }

            let mut receiver = TransferReceiver::new();
            let mut received = Vec::new();
            let mut last_percent = vec![0u8; bodies.len()];
            let mut complete = false;
            for message in messages {
                for event in receiver.handle(message) {
                    match event {
                        ReceiveEvent::Progress(p) => {
                            prop_assert!(p.percent >= last_percent[p.index]);
                            last_percent[p.index] = p.percent;
                        }
                        ReceiveEvent::FileReceived(file) => received.push(file),
                        ReceiveEvent::TransferComplete => complete = true,
                        ReceiveEvent::ProtocolViolation(v) => {
                            prop_assert!(false, "violation: {}", v);
                        }
                        ReceiveEvent::Manifest(_) => {}
                    }
                }
            }

            prop_assert!(complete);
            prop_assert_eq!(received.len(), bodies.len());
            for (file, body) in received.iter().zip(&bodies) {
                prop_assert_eq!(&file.data, body);
                prop_assert!(file.is_complete());
            }
            prop_assert!(receiver.manifest().iter().all(|e| e.progress == 100));
        }

        /// Percentages stay within 0..=100 and grow with the byte count
        #[test]
        fn percent_bounded_and_monotone(total in 1u64..1_000_000, a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let (lo, hi) = (a.min(b).min(total), a.max(b).min(total));
            prop_assert!(progress_percent(lo, total) <= progress_percent(hi, total));
            prop_assert!(progress_percent(hi, total) <= 100);
            prop_assert_eq!(progress_percent(total, total), 100);
        }
    }
}
