//! End-to-end subscription flow over real sockets: a node serving one
//! queue, clients speaking the wire protocol against it.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use stratus_core::acl::parse_access_str;
use stratus_core::config::default_config;
use stratus_core::runtime::server::{serve, NodeState};
use stratus_core::wire::{read_message, write_message, Message};
use stratus_core::{
    builtin_table, ClassSpec, Feedtype, Product, ProductClass, ProductQueue, SignalControl,
};

fn start_node(access: &str) -> (tempfile::TempDir, Arc<NodeState>, u16) {
    let dir = tempfile::tempdir().unwrap();
    let queue = ProductQueue::create(&dir.path().join("node.pq"), 64, 1 << 20).unwrap();
    let feedtypes = builtin_table();
    let table = parse_access_str(access, &feedtypes).unwrap();
    let mut config = default_config();
    config.peer.suspend_secs = 1;
    config.peer.connect_timeout_ms = 5_000;
    let state = Arc::new(NodeState::new(
        config,
        Arc::new(queue),
        SignalControl::unhooked(),
        feedtypes,
        table,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_state = Arc::clone(&state);
    std::thread::spawn(move || serve(listener, server_state));
    (dir, state, port)
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn ids_ddplus() -> Feedtype {
    let table = builtin_table();
    let ids = table.mask_of(&table.lookup("IDS").unwrap());
    let ddplus = table.mask_of(&table.lookup("DDPLUS").unwrap());
    ids | ddplus
}

#[test]
fn node_feeds_a_subscriber() {
    let (_dir, state, port) = start_node("ALLOW ANY 127.0.0.1\n");
    let product = Product::new(ids_ddplus(), 1, "foo", "test.origin", vec![7u8; 100]);
    state.queue.insert(&product).unwrap();

    let mut client = connect(port);
    let class = ProductClass::new(vec![ClassSpec::new(ids_ddplus(), ".*").unwrap()]);
    write_message(
        &mut client,
        &Message::FeedMe {
            class,
            max_hereis: u32::MAX,
        },
    )
    .unwrap();

    let id = match read_message(&mut client).unwrap() {
        Message::Ok { value } => value,
        other => panic!("expected Ok, got {:?}", other),
    };
    assert!(id > 0);

    match read_message(&mut client).unwrap() {
        Message::HereIs { product: received } => {
            assert_eq!(received.info.ident, "foo");
            assert_eq!(received.data, vec![7u8; 100]);
            assert_eq!(received.info.signature, product.info.signature);
        }
        other => panic!("expected HereIs, got {:?}", other),
    }

    // The worker is registered and answers liveness probes.
    let mut probe = connect(port);
    write_message(&mut probe, &Message::IsAlive { id }).unwrap();
    match read_message(&mut probe).unwrap() {
        Message::Alive { alive } => assert!(alive),
        other => panic!("expected Alive, got {:?}", other),
    }
}

#[test]
fn node_reduces_an_overbroad_request() {
    let access = "ALLOW NMC 127.0.0.1 ^sa.*\nALLOW NMC 127.0.0.1 ^fo.*\n";
    let (_dir, state, port) = start_node(access);
    let table = builtin_table();
    let nmc = table.mask_of(&table.lookup("NMC").unwrap());

    let mut client = connect(port);
    write_message(
        &mut client,
        &Message::FeedMe {
            class: ProductClass::new(vec![ClassSpec::new(nmc, ".*").unwrap()]),
            max_hereis: u32::MAX,
        },
    )
    .unwrap();

    let narrowed = match read_message(&mut client).unwrap() {
        Message::Reclass { class } => class,
        other => panic!("expected Reclass, got {:?}", other),
    };
    let sample = |ident: &str| {
        let mut p = Product::new(nmc, 0, ident, "t", vec![1]);
        p.info.arrival = stratus_core::Timestamp::now();
        p.info
    };
    assert!(narrowed.matches(&sample("salmon")));
    assert!(narrowed.matches(&sample("fox")));
    assert!(!narrowed.matches(&sample("other")));
    drop(state);
}

#[test]
fn node_denies_a_stranger() {
    // Only a host pattern that cannot match the loopback address.
    let (_dir, _state, port) = start_node("ALLOW ANY ^10\\.1\\.2\\.3$\n");
    let mut client = connect(port);
    write_message(
        &mut client,
        &Message::FeedMe {
            class: ProductClass::new(vec![ClassSpec::new(Feedtype(1), ".*").unwrap()]),
            max_hereis: u32::MAX,
        },
    )
    .unwrap();
    match read_message(&mut client).unwrap() {
        Message::Reclass { class } => assert!(class.is_empty()),
        other => panic!("expected empty Reclass, got {:?}", other),
    }
}

#[test]
fn node_accepts_a_pushed_product() {
    let access = "ACCEPT EXP ^obs/ 127.0.0.1\n";
    let (_dir, state, port) = start_node(access);
    let table = builtin_table();
    let exp = table.mask_of(&table.lookup("EXP").unwrap());

    let mut client = connect(port);
    write_message(
        &mut client,
        &Message::Hiya {
            class: ProductClass::new(vec![ClassSpec::new(exp, "^obs/").unwrap()]),
        },
    )
    .unwrap();
    match read_message(&mut client).unwrap() {
        Message::Ok { .. } => {}
        other => panic!("expected Ok, got {:?}", other),
    }

    let product = Product::new(exp, 9, "obs/station42", "pusher", b"observation".to_vec());
    write_message(
        &mut client,
        &Message::HereIs {
            product: product.clone(),
        },
    )
    .unwrap();

    // The insert lands shortly after the frame is read.
    let mut found = false;
    for _ in 0..100 {
        if let Ok(Some(_)) = state.queue.cursor_from_signature(&product.info.signature) {
            found = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(found, "pushed product never reached the queue");
}
