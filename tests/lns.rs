// Tests driving a local name server through its transport.
//
// All tests run with paused time. Whenever every task is waiting, the
// runtime jumps the clock forward to the next timer, so retransmission and
// discovery schedules play out instantly and deterministically.

mod common;

use common::{
    controllers, expect_active_set_request, expect_lookup, expect_mutation,
    settle, value, Harness,
};
use futures_util::future::join_all;
use gns::base::{Message, MutationOp, NodeId, ResponseCode, Ttl};
use gns::lns::select::SelectionPolicy;
use gns::lns::{Config, DiscoveryFailure, Error};
use rstest::rstest;
use std::time::Duration;
use tokio::time::Instant;

//------------ Lookups -------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn resolve_discovers_and_caches() {
    let mut h = Harness::new(Config::default());
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    assert!(controllers().contains(&dest));
    expect_active_set_request(msg, "g1");
    h.active_set("g1", Some(&[7]), dest);

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    let req = expect_lookup(msg);
    assert_eq!(req.name, "g1");
    assert_eq!(req.field, "addr");
    h.lookup_response(&req, dest, "1.2.3.4", Some(5));
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));

    // Within the TTL the cache answers without any traffic.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(h.lns.resolve("g1", "addr").await, Ok(value("1.2.3.4")));
    settle().await;
    assert!(h.try_next().is_none());

    // Once expired, the cached active set is asked directly.
    tokio::time::advance(Duration::from_secs(1)).await;
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });
    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    let req = expect_lookup(msg);
    h.lookup_response(&req, dest, "5.6.7.8", Some(5));
    assert_eq!(call.await.unwrap(), Ok(value("5.6.7.8")));
    assert!(h.try_next().is_none());

    let stats = h.lns.stats().get("g1").unwrap();
    assert_eq!(stats.lookups, 3);
    assert_eq!(stats.lookup_responses, 2);
    assert_eq!(h.lns.pending_requests(), 0);
    assert_eq!(h.lns.pending_discoveries(), 0);
}

#[tokio::test(start_paused = true)]
async fn piggybacked_active_set_is_cached() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(7)]);
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    let req = expect_lookup(msg);
    h.lns.handle_message(
        gns::base::message::LookupResponse {
            request_id: req.request_id,
            value: value("1.2.3.4"),
            ttl: None,
            responder: dest,
            active: Some(vec![NodeId::new(8), NodeId::new(9)]),
        }
        .into(),
    );
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));
    assert_eq!(
        h.lns.cache().lookup_active_set("g1"),
        Some(vec![NodeId::new(8), NodeId::new(9)])
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_lookups_share_one_discovery() {
    let mut h = Harness::new(Config::default());
    let calls: Vec<_> = (0..10)
        .map(|_| {
            let lns = h.lns.clone();
            tokio::spawn(async move { lns.resolve("g1", "addr").await })
        })
        .collect();
    settle().await;

    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    assert!(h.try_next().is_none());
    assert_eq!(h.lns.pending_discoveries(), 1);
    assert_eq!(h.lns.pending_requests(), 10);
    assert!(h.lns.discovery().is_pending("g1"));
    assert_eq!(h.lns.discovery().waiters("g1"), 10);
    assert_eq!(h.lns.discovery().attempts("g1"), 1);

    h.active_set("g1", Some(&[7]), dest);
    for _ in 0..10 {
        let (dest, msg) = h.next().await;
        assert_eq!(dest, NodeId::new(7));
        let req = expect_lookup(msg);
        h.lookup_response(&req, dest, "1.2.3.4", None);
    }
    for res in join_all(calls).await {
        assert_eq!(res.unwrap(), Ok(value("1.2.3.4")));
    }
    assert_eq!(h.lns.pending_discoveries(), 0);
    assert!(h.lns.discovery().is_empty());
    assert_eq!(h.lns.discovery().waiters("g1"), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_active_sets_exhaust_discovery() {
    let mut config = Config::default();
    config.set_max_discovery_attempts(Some(2));
    let mut h = Harness::new(config);

    let lns = h.lns.clone();
    let first = tokio::spawn(async move { lns.resolve("g1", "addr").await });
    let (first_dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");

    let lns = h.lns.clone();
    let second = tokio::spawn(async move { lns.resolve("g1", "port").await });
    settle().await;
    h.active_set("g1", Some(&[]), first_dest);

    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    assert_ne!(dest, first_dest);
    h.active_set("g1", Some(&[]), dest);

    // Controllers that answer with an empty set were reached, so the
    // failure reports the name as not replicated rather than lumping it in
    // with unreachable controllers. Both are discovery exhaustion.
    let exhausted =
        Err(Error::DiscoveryExhausted(DiscoveryFailure::NotReplicated));
    assert_eq!(first.await.unwrap(), exhausted);
    assert_eq!(second.await.unwrap(), exhausted);
    assert_eq!(h.lns.pending_discoveries(), 0);
    assert_eq!(h.lns.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_controllers_exhaust_discovery() {
    let mut h = Harness::new(Config::default());
    let start = Instant::now();
    let res = h.lns.resolve("g1", "addr").await;
    assert_eq!(
        res,
        Err(Error::DiscoveryExhausted(
            DiscoveryFailure::NoControllerReachable
        ))
    );
    // Two rounds over three controllers fit into the maximum wait time.
    assert_eq!(start.elapsed(), Duration::from_secs(6));

    let sent = h.drain();
    assert_eq!(sent.len(), 6);
    let order: Vec<_> =
        sent.iter().map(|(dest, _)| dest.into_u32()).collect();
    assert_eq!(order, [1, 2, 3, 1, 2, 3]);
    for (_, msg) in sent {
        expect_active_set_request(msg, "g1");
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_name_fails_discovery() {
    let mut config = Config::default();
    config.set_max_discovery_attempts(Some(1));
    let mut h = Harness::new(config);
    let start = Instant::now();
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    h.active_set("g1", None, dest);
    assert_eq!(
        call.await.unwrap(),
        Err(Error::DiscoveryExhausted(DiscoveryFailure::NoRecord))
    );
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(h.lns.discovery().is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_empty_answer_keeps_discovery_running() {
    let mut config = Config::default();
    config.set_max_discovery_attempts(Some(2));
    let mut h = Harness::new(config);
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (first, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    let (second, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    assert_eq!(h.lns.discovery().attempts("g1"), 2);

    // The first controller answers only after the second has been asked.
    h.active_set("g1", Some(&[]), first);
    assert!(h.lns.discovery().is_pending("g1"));
    h.active_set("g1", Some(&[7]), second);

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    h.lookup_response(&expect_lookup(msg), dest, "1.2.3.4", None);
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));
}

#[tokio::test(start_paused = true)]
async fn answers_from_unasked_controllers_are_ignored() {
    let mut config = Config::default();
    config.set_max_discovery_attempts(Some(1));
    let mut h = Harness::new(config);
    let start = Instant::now();
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(1));
    expect_active_set_request(msg, "g1");
    h.active_set("g1", Some(&[]), NodeId::new(3));
    assert!(h.lns.discovery().is_pending("g1"));

    assert_eq!(
        call.await.unwrap(),
        Err(Error::DiscoveryExhausted(
            DiscoveryFailure::NoControllerReachable
        ))
    );
    assert_eq!(start.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn discovery_stops_at_max_wait() {
    let mut config = Config::default();
    config.set_max_discovery_attempts(Some(10));
    config.set_max_wait(Duration::from_millis(2500));
    let mut h = Harness::new(config);

    let start = Instant::now();
    assert_eq!(h.lns.resolve("g1", "addr").await, Err(Error::Timeout));
    assert_eq!(start.elapsed(), Duration::from_millis(2500));
    assert!(h.lns.discovery().is_pending("g1"));

    // Controllers were asked at 0, 1 and 2 seconds. At 3 seconds the run
    // has used up the maximum wait time and ends despite attempts left.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.lns.discovery().is_empty());
    let sent = h.drain();
    assert_eq!(sent.len(), 3);
    for (_, msg) in sent {
        expect_active_set_request(msg, "g1");
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_active_set_triggers_rediscovery() {
    let mut h = Harness::new(Config::default());
    let start = Instant::now();
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    h.active_set("g1", Some(&[3]), dest);

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(3));
    let req = expect_lookup(msg);
    h.lookup_error(&req, dest, ResponseCode::InvalidActiveSet);
    assert_eq!(h.lns.cache().lookup_active_set("g1"), None);

    // Rediscovery starts at the next tick and holds off for a tenth of
    // the discovery period.
    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    assert_eq!(start.elapsed(), Duration::from_millis(2100));
    h.active_set("g1", Some(&[7]), dest);

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    let req = expect_lookup(msg);
    h.lookup_response(&req, dest, "1.2.3.4", None);
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));
}

#[tokio::test(start_paused = true)]
async fn invalid_active_set_budget() {
    let mut config = Config::default();
    config.set_max_restarts(0);
    let mut h = Harness::new(config);
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(3)]);
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, msg) = h.next().await;
    let req = expect_lookup(msg);
    h.lookup_error(&req, dest, ResponseCode::InvalidActiveSet);
    assert_eq!(call.await.unwrap(), Err(Error::InvalidActiveSet));
    assert_eq!(h.lns.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn lookup_errors_are_reported() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(7)]);

    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });
    let (dest, msg) = h.next().await;
    h.lookup_error(&expect_lookup(msg), dest, ResponseCode::RecordNotFound);
    assert_eq!(call.await.unwrap(), Err(Error::RecordNotFound));

    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });
    let (dest, msg) = h.next().await;
    h.lookup_error(&expect_lookup(msg), dest, ResponseCode::GenericError);
    assert_eq!(
        call.await.unwrap(),
        Err(Error::Server(ResponseCode::GenericError))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_lookup_times_out() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(7)]);

    let start = Instant::now();
    let res = h.lns.resolve("g1", "addr").await;
    assert_eq!(res, Err(Error::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(16));
    assert!(elapsed <= Duration::from_secs(18));

    // Sent at 0, 2, 4, ..., 14 seconds.
    let sent = h.drain();
    assert_eq!(sent.len(), 8);
    assert!(sent.iter().all(|(dest, _)| *dest == NodeId::new(7)));

    // A late answer is dropped.
    let (dest, msg) = sent.into_iter().next().unwrap();
    h.lookup_response(&expect_lookup(msg), dest, "1.2.3.4", None);
    assert_eq!(h.lns.cache().lookup_value("g1", "addr"), None);
    assert_eq!(h.lns.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn retransmission_moves_to_next_replica() {
    let mut h = Harness::new(Config::default());
    h.lns
        .cache()
        .upsert_active_set("g1", vec![NodeId::new(4), NodeId::new(6)]);
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });

    let (dest, _) = h.next().await;
    assert_eq!(dest, NodeId::new(4));
    let (dest, _) = h.next().await;
    assert_eq!(dest, NodeId::new(6));
    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(4));
    h.lookup_response(&expect_lookup(msg), dest, "1.2.3.4", None);
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));
}

#[rstest]
#[case(SelectionPolicy::ClosestLatency, 4)]
#[case(SelectionPolicy::LatencyPlusLoad, 6)]
#[case(SelectionPolicy::Beehive, 8)]
#[tokio::test(start_paused = true)]
async fn selection_policy(
    #[case] policy: SelectionPolicy,
    #[case] expected: u32,
) {
    let mut config = Config::default();
    config.set_selection_policy(policy);
    let mut h = Harness::new(config);
    // Node 4 is busy and node 7 is the closest node overall.
    h.lns.nodes().update_load(NodeId::new(4), 10.);
    h.lns
        .nodes()
        .update_latency(NodeId::new(7), Duration::from_millis(1));
    h.lns
        .cache()
        .upsert_active_set("g1", [4, 6, 8].map(NodeId::new).to_vec());

    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.resolve("g1", "addr").await });
    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(expected));
    h.lookup_response(&expect_lookup(msg), dest, "1.2.3.4", None);
    assert_eq!(call.await.unwrap(), Ok(value("1.2.3.4")));
}

//------------ Mutations -----------------------------------------------------

#[tokio::test(start_paused = true)]
async fn add_name_installs_controllers() {
    let mut h = Harness::new(Config::default());
    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.add_name("g2", "addr", value("1.1.1.1")).await
    });

    let (dest, msg) = h.next().await;
    assert!(controllers().contains(&dest));
    let req = expect_mutation(msg);
    assert_eq!(req.op, MutationOp::AddName);
    assert_eq!(req.new_value, value("1.1.1.1"));
    h.confirm(&req, dest, ResponseCode::NoError);

    assert_eq!(call.await.unwrap(), Ok(()));
    assert_eq!(h.lns.cache().lookup_active_set("g2"), Some(controllers()));
    let stats = h.lns.stats().get("g2").unwrap();
    assert_eq!((stats.updates, stats.update_responses), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn add_name_moves_on_to_next_controller() {
    let mut h = Harness::new(Config::default());
    let start = Instant::now();
    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.add_name("g2", "addr", value("1.1.1.1")).await
    });

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(1));
    h.confirm(&expect_mutation(msg), dest, ResponseCode::InvalidActiveSet);

    // Controllers don't need discovering, the next tick asks another one.
    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(2));
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    let req = expect_mutation(msg);
    assert_eq!(req.op, MutationOp::AddName);
    h.confirm(&req, dest, ResponseCode::NoError);

    assert_eq!(call.await.unwrap(), Ok(()));
    assert_eq!(h.lns.pending_discoveries(), 0);
}

#[tokio::test(start_paused = true)]
async fn remove_name_invalid_active_set_budget() {
    let mut config = Config::default();
    config.set_max_restarts(0);
    let mut h = Harness::new(config);
    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.remove_name("g1").await });

    let (dest, msg) = h.next().await;
    assert!(controllers().contains(&dest));
    let req = expect_mutation(msg);
    assert_eq!(req.op, MutationOp::RemoveName);
    h.confirm(&req, dest, ResponseCode::InvalidActiveSet);
    assert_eq!(call.await.unwrap(), Err(Error::InvalidActiveSet));
    assert!(h.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn update_invalidates_field() {
    let mut h = Harness::new(Config::default());
    let cache = h.lns.cache();
    cache.upsert_active_set("g1", vec![NodeId::new(7)]);
    let ttl = Ttl::from_secs(60);
    cache.upsert_from_response("g1", "addr", value("1.2.3.4"), ttl);
    cache.upsert_from_response("g1", "port", value("53"), ttl);

    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.mutate(
            "g1",
            "addr",
            MutationOp::CompareAndReplace,
            value("5.6.7.8"),
            Some(value("1.2.3.4")),
        )
        .await
    });
    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    let req = expect_mutation(msg);
    assert_eq!(req.old_value, Some(value("1.2.3.4")));
    h.confirm(&req, dest, ResponseCode::NoError);

    assert_eq!(call.await.unwrap(), Ok(()));
    let cache = h.lns.cache();
    assert_eq!(cache.lookup_value("g1", "addr"), None);
    assert_eq!(cache.lookup_value("g1", "port"), Some(value("53")));
}

#[tokio::test(start_paused = true)]
async fn remove_name_evicts_entry() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(7)]);

    let lns = h.lns.clone();
    let call = tokio::spawn(async move { lns.remove_name("g1").await });
    let (dest, msg) = h.next().await;
    assert!(controllers().contains(&dest));
    let req = expect_mutation(msg);
    assert_eq!(req.op, MutationOp::RemoveName);
    h.confirm(&req, dest, ResponseCode::NoError);

    assert_eq!(call.await.unwrap(), Ok(()));
    assert!(!h.lns.cache().contains("g1"));
}

#[tokio::test(start_paused = true)]
async fn failed_mutations() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(7)]);

    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.mutate("g1", "addr", MutationOp::Append, value("x"), None)
            .await
    });
    let (dest, msg) = h.next().await;
    h.confirm(&expect_mutation(msg), dest, ResponseCode::RecordNotFound);
    assert_eq!(call.await.unwrap(), Err(Error::RecordNotFound));

    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.mutate("g1", "addr", MutationOp::Remove, value("x"), None)
            .await
    });
    let (dest, msg) = h.next().await;
    h.confirm(&expect_mutation(msg), dest, ResponseCode::GenericError);
    assert_eq!(
        call.await.unwrap(),
        Err(Error::MutationFailed(ResponseCode::GenericError))
    );
}

#[tokio::test(start_paused = true)]
async fn mutation_rediscovers_stale_active_set() {
    let mut h = Harness::new(Config::default());
    h.lns.cache().upsert_active_set("g1", vec![NodeId::new(3)]);

    let lns = h.lns.clone();
    let call = tokio::spawn(async move {
        lns.mutate("g1", "addr", MutationOp::Replace, value("x"), None)
            .await
    });
    let (dest, msg) = h.next().await;
    h.confirm(&expect_mutation(msg), dest, ResponseCode::InvalidActiveSet);

    let (dest, msg) = h.next().await;
    expect_active_set_request(msg, "g1");
    h.active_set("g1", Some(&[7]), dest);

    let (dest, msg) = h.next().await;
    assert_eq!(dest, NodeId::new(7));
    h.confirm(&expect_mutation(msg), dest, ResponseCode::NoError);
    assert_eq!(call.await.unwrap(), Ok(()));
}

//------------ Requests rejected up front ------------------------------------

#[tokio::test(start_paused = true)]
async fn malformed_requests() {
    let mut h = Harness::new(Config::default());
    assert!(matches!(
        h.lns.resolve("", "addr").await,
        Err(Error::Malformed(_))
    ));
    assert!(matches!(
        h.lns.resolve("g1", "").await,
        Err(Error::Malformed(_))
    ));
    let op = MutationOp::CompareAndReplace;
    assert!(matches!(
        h.lns.mutate("g1", "addr", op, value("x"), None).await,
        Err(Error::Malformed(_))
    ));
    assert!(matches!(
        h.lns.remove_name(" ").await,
        Err(Error::Malformed(_))
    ));

    settle().await;
    assert!(h.try_next().is_none());
    assert_eq!(h.lns.pending_requests(), 0);
    assert!(h.lns.stats().get("g1").is_none());
}

#[tokio::test(start_paused = true)]
async fn requests_sent_to_lns_are_ignored() {
    let mut h = Harness::new(Config::default());
    h.lns.handle_message(Message::from(
        gns::base::message::ActiveSetRequest {
            name: "g1".into(),
            requesting_node: NodeId::new(1),
        },
    ));
    settle().await;
    assert!(h.try_next().is_none());
    assert_eq!(h.lns.pending_discoveries(), 0);
}
