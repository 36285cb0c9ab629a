#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

//! Stream-chunking properties: for any well-formed byte stream and any split
//! of it into chunks, the parser must yield exactly the same message
//! sequence as for the unsplit stream.

use mrpc_proto::{IntoParams as _, Message, MessageParser, Params};
use proptest::prelude::*;
use rmpv::Value;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Nil),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9]{0,24}".prop_map(Value::from),
    ]
}

fn params_strategy() -> impl Strategy<Value = Params> {
    proptest::collection::vec(value_strategy(), 0..4).prop_map(Params::new)
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<u32>(), "[a-z]{1,12}", params_strategy())
            .prop_map(|(id, method, params)| Message::request(id.into(), method.as_str(), params)),
        (any::<u32>(), value_strategy())
            .prop_map(|(id, result)| Message::response(id.into(), result)),
        (any::<u32>(), value_strategy())
            .prop_map(|(id, error)| Message::error_response(id.into(), error)),
        ("[a-z]{1,12}", params_strategy())
            .prop_map(|(method, params)| Message::notification(method.as_str(), params)),
    ]
}

proptest! {
    #[test]
    fn serialize_then_parse_round_trips(msg in message_strategy()) {
        let encoded = msg.serialize().unwrap();
        let decoded = Message::decode(encoded.as_bytes()).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn chunk_split_invariance(
        msgs in proptest::collection::vec(message_strategy(), 1..5),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut stream = Vec::new();
        for msg in &msgs {
            stream.extend_from_slice(msg.serialize().unwrap().as_bytes());
        }

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut parser = MessageParser::new();
        let mut parsed = Vec::new();
        for window in points.windows(2) {
            parser.feed(&stream[window[0]..window[1]]);
            while let Some(msg) = parser.try_next().unwrap() {
                parsed.push(msg);
            }
        }

        prop_assert_eq!(parsed, msgs);
        prop_assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_parsing(msg in message_strategy()) {
        let encoded = msg.serialize().unwrap();

        let mut parser = MessageParser::new();
        let mut parsed = None;
        for byte in encoded.as_bytes() {
            parser.feed(std::slice::from_ref(byte));
            if let Some(m) = parser.try_next().unwrap() {
                parsed = Some(m);
            }
        }

        prop_assert_eq!(parsed, Some(msg));
    }
}

#[test]
fn empty_params_tuple_matches_explicit_empty() {
    let a = Message::request(1.into(), "m", ().into_params().unwrap());
    let b = Message::request(1.into(), "m", Params::empty());
    assert_eq!(
        a.serialize().unwrap().as_bytes(),
        b.serialize().unwrap().as_bytes()
    );
}
