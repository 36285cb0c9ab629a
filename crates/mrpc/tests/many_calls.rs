#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

//! Stress: many calls pipelined over one connection keep their pairing.

use std::time::Duration;

use mrpc::{ClientBuilder, ServerBuilder};

#[test]
fn many_pipelined_async_calls_each_get_their_own_result() {
    const CALLS: i64 = 500;

    let server = ServerBuilder::new()
        .method("double", |(x,): (i64,)| Ok(x * 2))
        .listen_to("tcp://127.0.0.1:0")
        .build()
        .unwrap();

    let client = ClientBuilder::new()
        .connect_to(server.local_uris()[0].to_string())
        .build()
        .unwrap();
    client.wait_until_connected(Duration::from_secs(5)).unwrap();

    let futures: Vec<_> = (0..CALLS)
        .map(|i| client.async_call::<i64>("double", (i,)))
        .collect();

    for (i, future) in futures.into_iter().enumerate() {
        let expected = i64::try_from(i).unwrap() * 2;
        assert_eq!(future.get_result().unwrap(), expected);
    }
}

#[test]
fn sequential_calls_reuse_the_connection() {
    let server = ServerBuilder::new()
        .method("double", |(x,): (i64,)| Ok(x * 2))
        .listen_to("tcp://127.0.0.1:0")
        .build()
        .unwrap();

    let client = ClientBuilder::new()
        .connect_to(server.local_uris()[0].to_string())
        .build()
        .unwrap();
    client.wait_until_connected(Duration::from_secs(5)).unwrap();

    for i in 0..200_i64 {
        let doubled: i64 = client.call("double", (i,)).unwrap();
        assert_eq!(doubled, i * 2);
    }
}
