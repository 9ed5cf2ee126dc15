//! Update engine behavior against a scripted server.

mod common;

use std::time::Duration;

use common::*;
use shavar::shavar_api::mac::mac_digest;
use shavar::{ListState, MacKeys};
use shavar_hash::{host_key, prefix};

const LIST: &str = "goog-malware-shavar";

fn lists(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn applies_chunks_from_redirects() {
    let transport = ScriptedTransport::new();
    let evil = host_key("evil.example.net");
    let phish = host_key("phish.example.org");
    let block = add_chunk_block(
        42,
        &[
            (evil, four_bytes(prefix("evil.example.net/").as_bytes())),
            (phish, four_bytes(prefix("phish.example.org/").as_bytes())),
        ],
    );
    transport.route("downloads", 200, "i:goog-malware-shavar\nn:1800\nu:cache.test/chunk1\n");
    transport.route("cache.test/chunk1", 200, block);

    let sb = client(transport.clone());
    let before = now_secs();
    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(1800));

    // Both entries landed under their host keys.
    let store = sb.store();
    let found = store.get_add_chunks(evil, &lists(&[LIST])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].chunknum, 42);
    assert_eq!(found[0].prefix, prefix("evil.example.net/"));
    assert_eq!(store.get_add_chunks(phish, &lists(&[LIST])).await.unwrap().len(), 1);

    // One state record per list per round.
    let state = sb.state().list_state(LIST).await.unwrap();
    assert_eq!(state.wait, 1800);
    assert_eq!(state.errors, 0);
    assert!(state.time >= before && state.time <= now_secs());

    // The redirect went out over HTTPS.
    let redirect_urls = transport.requests_matching("cache.test/chunk1");
    assert_eq!(redirect_urls.len(), 1);
    assert!(redirect_urls[0].0.starts_with("https://"));
}

#[tokio::test]
async fn reapplying_the_same_response_is_idempotent() {
    let transport = ScriptedTransport::new();
    let evil = host_key("evil.example.net");
    let block = add_chunk_block(42, &[(evil, four_bytes(prefix("evil.example.net/").as_bytes()))]);
    transport.route("downloads", 200, "i:goog-malware-shavar\nn:1800\nu:cache.test/chunk1\n");
    transport.route("cache.test/chunk1", 200, block);

    let sb = client(transport.clone());
    sb.update_forced(&[LIST]).await;
    sb.update_forced(&[LIST]).await;

    let store = sb.store();
    let found = store.get_add_chunks(evil, &lists(&[LIST])).await.unwrap();
    assert_eq!(found.len(), 1);
    let (a_range, _) = store.get_regions(LIST).await.unwrap();
    assert_eq!(a_range, "42");
}

#[tokio::test]
async fn reset_directive_wipes_the_list_and_skips_redirects() {
    let transport = ScriptedTransport::new();
    transport.route(
        "downloads",
        200,
        "i:goog-malware-shavar\nu:cache.test/never\nr:pleasereset\n",
    );

    let sb = client(transport.clone());

    // Seed a populated list.
    let mut seed = Vec::new();
    for chunknum in 1..=100u32 {
        seed.push(shavar::shavar_db::AddChunk {
            list: LIST.to_string(),
            chunknum,
            host: chunknum,
            prefix: shavar_hash::Prefix::empty(),
        });
    }
    sb.store().add_chunks_a(&seed).await.unwrap();

    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(10));

    let (a_range, s_range) = sb.store().get_regions(LIST).await.unwrap();
    assert_eq!(a_range, "");
    assert_eq!(s_range, "");

    // The queued redirect was discarded.
    assert!(transport.requests_matching("cache.test/never").is_empty());
}

#[tokio::test]
async fn delete_directives_drop_chunks_and_their_hashes() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "i:goog-malware-shavar\nn:300\nad:1-2\nsd:9\n");

    let sb = client(transport.clone());
    let store = sb.store();
    let entries: Vec<_> = (1..=3u32)
        .map(|chunknum| shavar::shavar_db::AddChunk {
            list: LIST.to_string(),
            chunknum,
            host: 7,
            prefix: shavar_hash::Prefix::empty(),
        })
        .collect();
    store.add_chunks_a(&entries).await.unwrap();
    store
        .add_chunks_s(&[shavar::shavar_db::SubChunk {
            list: LIST.to_string(),
            chunknum: 9,
            add_chunknum: 3,
            host: 7,
            prefix: shavar_hash::Prefix::empty(),
        }])
        .await
        .unwrap();
    store
        .add_full_hashes(
            &[shavar::shavar_db::CachedHash {
                list: LIST.to_string(),
                chunknum: 1,
                hash: shavar_hash::full_hash("evil.example.net/"),
            }],
            now_secs(),
        )
        .await
        .unwrap();

    sb.update(&[LIST]).await;

    let (a_range, s_range) = store.get_regions(LIST).await.unwrap();
    assert_eq!(a_range, "3");
    assert_eq!(s_range, "");
    // Full hashes of deleted add-chunks die with them.
    assert!(store.get_full_hashes(LIST, 1, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_response_schedules_the_default_retry() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "");

    let sb = client(transport);
    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(30));

    let state = sb.state().list_state(LIST).await.unwrap();
    assert_eq!(state.wait, 30);
    assert_eq!(state.errors, 0);
}

#[tokio::test]
async fn server_errors_escalate_backoff() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 500, "oops");

    let sb = client(transport);

    let first = sb.update_forced(&[LIST]).await;
    assert_eq!(first, Duration::from_secs(60));
    assert_eq!(sb.state().list_state(LIST).await.unwrap().errors, 1);

    let second = sb.update_forced(&[LIST]).await;
    assert!((1800..=3600).contains(&second.as_secs()), "got {second:?}");
    assert_eq!(sb.state().list_state(LIST).await.unwrap().errors, 2);

    let third = sb.update_forced(&[LIST]).await;
    assert!((3600..=7200).contains(&third.as_secs()), "got {third:?}");
    assert_eq!(sb.state().list_state(LIST).await.unwrap().errors, 3);
}

#[tokio::test]
async fn lists_that_are_not_due_are_skipped() {
    let transport = ScriptedTransport::new();
    let sb = client(transport.clone());

    sb.state()
        .set_list_state(
            LIST,
            &ListState {
                time: now_secs(),
                wait: 9999,
                errors: 0,
            },
        )
        .await
        .unwrap();

    let wait = sb.update(&[LIST]).await;
    assert!(wait.as_secs() > 9000, "got {wait:?}");
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn concurrent_updates_are_rejected() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "n:1800\n");
    transport.set_delay(Duration::from_millis(100));

    let sb = client(transport);
    let (first, second) = tokio::join!(sb.update_forced(&[LIST]), sb.update_forced(&[LIST]));

    // One call ran the round; the re-entrant one got the default retry.
    let mut waits = [first.as_secs(), second.as_secs()];
    waits.sort_unstable();
    assert_eq!(waits[0], 30);
    assert_eq!(waits[1], 1800);
}

#[tokio::test]
async fn request_body_reports_stored_ranges() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "n:300\n");

    let sb = client(transport.clone());
    let store = sb.store();
    let entries: Vec<_> = [1u32, 2, 3, 5]
        .iter()
        .map(|&chunknum| shavar::shavar_db::AddChunk {
            list: LIST.to_string(),
            chunknum,
            host: 1,
            prefix: shavar_hash::Prefix::empty(),
        })
        .collect();
    store.add_chunks_a(&entries).await.unwrap();
    store
        .add_chunks_s(&[shavar::shavar_db::SubChunk {
            list: LIST.to_string(),
            chunknum: 7,
            add_chunknum: 1,
            host: 1,
            prefix: shavar_hash::Prefix::empty(),
        }])
        .await
        .unwrap();

    sb.update(&[LIST]).await;

    let downloads = transport.requests_matching("downloads");
    assert_eq!(downloads.len(), 1);
    let body = String::from_utf8(downloads[0].1.clone()).unwrap();
    assert_eq!(body, "goog-malware-shavar;a:1-3,5:s:7\n");

    // The range request matches the protocol grammar.
    let grammar = regex::Regex::new(r"^([a-z]:[\d,-]+(?::[a-z]:[\d,-]+)?)?$").unwrap();
    let after_list = body.trim_end().split_once(';').unwrap().1;
    assert!(grammar.is_match(after_list), "bad body {after_list:?}");
}

#[tokio::test]
async fn mac_failure_discards_the_whole_round() {
    let transport = ScriptedTransport::new();
    transport.route(
        "downloads",
        200,
        "m:bogusdigest=\nn:1800\ni:goog-malware-shavar\nu:cache.test/chunk1\n",
    );

    let mut config = test_config();
    config.mac = true;
    let sb = client_with(transport.clone(), config);
    sb.state()
        .set_mac_keys(&MacKeys {
            client_key: b"coolkey".to_vec(),
            wrapped_key: "wrapped-opaque".to_string(),
        })
        .await
        .unwrap();

    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(60));
    assert_eq!(sb.state().list_state(LIST).await.unwrap().errors, 1);

    // No redirect was fetched, nothing was stored.
    assert!(transport.requests_matching("cache.test").is_empty());
    let (a_range, _) = sb.store().get_regions(LIST).await.unwrap();
    assert_eq!(a_range, "");
}

#[tokio::test]
async fn mac_validated_rounds_apply_and_echo_the_wrapped_key() {
    let transport = ScriptedTransport::new();
    let evil = host_key("evil.example.net");
    let block = add_chunk_block(7, &[(evil, four_bytes(prefix("evil.example.net/").as_bytes()))]);

    let payload_mac = mac_digest(b"coolkey", &block);
    let body = format!("n:1800\ni:goog-malware-shavar\nu:cache.test/chunk1,{payload_mac}\n");
    let response = format!("m:{}\n{body}", mac_digest(b"coolkey", body.as_bytes()));

    transport.route("downloads", 200, response);
    transport.route("cache.test/chunk1", 200, block);

    let mut config = test_config();
    config.mac = true;
    let sb = client_with(transport.clone(), config);
    sb.state()
        .set_mac_keys(&MacKeys {
            client_key: b"coolkey".to_vec(),
            wrapped_key: "wrapped-opaque".to_string(),
        })
        .await
        .unwrap();

    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(1800));

    let found = sb.store().get_add_chunks(evil, &lists(&[LIST])).await.unwrap();
    assert_eq!(found.len(), 1);

    let downloads = transport.requests_matching("downloads");
    assert!(downloads[0].0.contains("wrkey=wrapped-opaque"));
}

#[tokio::test]
async fn rekey_directive_drops_keys_and_retries_shortly() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "e:pleaserekey\n");

    let mut config = test_config();
    config.mac = true;
    let sb = client_with(transport, config);
    sb.state()
        .set_mac_keys(&MacKeys {
            client_key: b"coolkey".to_vec(),
            wrapped_key: "wrapped-opaque".to_string(),
        })
        .await
        .unwrap();

    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(10));
    assert!(sb.state().mac_keys().await.is_none());
}

#[tokio::test]
async fn missing_keys_are_fetched_from_newkey() {
    let transport = ScriptedTransport::new();
    transport.route(
        "newkey",
        200,
        "clientkey:12:Y29vbGtleQ==\nwrappedkey:14:wrapped-opaque\n",
    );
    let body = "n:1800\n";
    let response = format!("m:{}\n{body}", mac_digest(b"coolkey", body.as_bytes()));
    transport.route("downloads", 200, response);

    let mut config = test_config();
    config.mac = true;
    let sb = client_with(transport.clone(), config);

    let wait = sb.update(&[LIST]).await;
    assert_eq!(wait, Duration::from_secs(1800));

    let keys = sb.state().mac_keys().await.unwrap();
    assert_eq!(keys.client_key, b"coolkey");
    assert_eq!(keys.wrapped_key, "wrapped-opaque");
    assert_eq!(transport.requests_matching("newkey").len(), 1);
}

#[tokio::test]
async fn minimum_wait_wins_across_lists() {
    let transport = ScriptedTransport::new();
    transport.route("downloads", 200, "n:1800\n");

    let sb = client(transport);
    // Second list rides the same scripted response; both succeed with
    // 1800, so the minimum is 1800.
    let wait = sb.update(&[LIST, "goog-phish-shavar"]).await;
    assert_eq!(wait, Duration::from_secs(1800));

    assert!(sb.state().list_state("goog-phish-shavar").await.is_some());
    assert!(sb.state().list_state(LIST).await.is_some());
}
