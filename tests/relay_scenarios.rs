//! End-to-end relay tests: real sockets between client, proxy and origin.

use std::time::Duration;

use forward_proxy::cache::cache_file_name;
use tokio::net::TcpListener;

mod common;

use common::{cache_files, ok_response, send_raw, start_proxy, test_config, MockOrigin, Reply};

fn get(url: &str, port: u16) -> Vec<u8> {
    format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").into_bytes()
}

#[tokio::test]
async fn get_miss_relays_and_caches() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Body(b"hello".to_vec())).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let url = origin.url("/index.html");
    let request = get(&url, origin.addr.port());
    let response = send_raw(proxy.addr, &request).await;

    assert_eq!(response, ok_response(b"hello"));
    assert_eq!(origin.requests(), vec![request]);

    let stored = std::fs::read(dir.path().join(cache_file_name(&url))).unwrap();
    assert_eq!(stored, response);
    proxy.stop().await;
}

#[tokio::test]
async fn repeat_get_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Body(b"cached body".to_vec())).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let request = get(&origin.url("/page"), origin.addr.port());
    let first = send_raw(proxy.addr, &request).await;
    let second = send_raw(proxy.addr, &request).await;

    assert_eq!(first, second);
    assert_eq!(origin.accepted(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_origin_gets_bad_gateway_and_proxy_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = start_proxy(test_config(dir.path())).await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let url = format!("http://127.0.0.1:{port}/");
    let response = send_raw(proxy.addr, &get(&url, port)).await;
    assert!(response.starts_with(b"HTTP/1.1 502 "), "{}", String::from_utf8_lossy(&response));
    assert!(cache_files(dir.path()).is_empty());

    let origin = MockOrigin::start(Reply::Body(b"still up".to_vec())).await;
    let response = send_raw(proxy.addr, &get(&origin.url("/"), origin.addr.port())).await;
    assert_eq!(response, ok_response(b"still up"));
    proxy.stop().await;
}

#[tokio::test]
async fn unresolvable_host_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = start_proxy(test_config(dir.path())).await;

    let request = b"GET http://nonexistent.invalid/ HTTP/1.1\r\nHost: nonexistent.invalid\r\n\r\n";
    let response = send_raw(proxy.addr, request).await;

    assert!(
        response.starts_with(b"HTTP/1.1 502 ") || response.starts_with(b"HTTP/1.1 504 "),
        "{}",
        String::from_utf8_lossy(&response)
    );
    assert!(cache_files(dir.path()).is_empty());
    proxy.stop().await;
}

#[tokio::test]
async fn post_forwards_body_with_newline_and_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Echo).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let header = format!(
        "POST /submit HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 4\r\n\r\n",
        origin.addr.port()
    );
    let request = format!("{header}data");
    let expected_forward = format!("{header}data\n").into_bytes();

    let first = send_raw(proxy.addr, request.as_bytes()).await;
    assert_eq!(first, ok_response(&expected_forward));
    assert_eq!(origin.requests(), vec![expected_forward.clone()]);

    let second = send_raw(proxy.addr, request.as_bytes()).await;
    assert_eq!(second, first);
    assert_eq!(origin.accepted(), 2);
    assert!(cache_files(dir.path()).is_empty());
    proxy.stop().await;
}

#[tokio::test]
async fn distinct_targets_are_distinct_entries() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Echo).await;
    let proxy = start_proxy(test_config(dir.path())).await;
    let port = origin.addr.port();

    let urls = [origin.url("/a"), origin.url("/a/"), origin.url("/a?x")];
    for url in &urls {
        send_raw(proxy.addr, &get(url, port)).await;
    }

    assert_eq!(origin.accepted(), 3);
    let mut expected: Vec<String> = urls.iter().map(|u| cache_file_name(u)).collect();
    expected.sort();
    assert_eq!(cache_files(dir.path()), expected);
    proxy.stop().await;
}

#[tokio::test]
async fn concurrent_misses_store_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let origin =
        MockOrigin::start_with_delay(Reply::Body(b"slow".to_vec()), Duration::from_millis(200)).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let request = get(&origin.url("/same"), origin.addr.port());
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let request = request.clone();
        let addr = proxy.addr;
        tasks.push(tokio::spawn(async move { send_raw(addr, &request).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), ok_response(b"slow"));
    }

    assert_eq!(cache_files(dir.path()), vec![cache_file_name(&origin.url("/same"))]);
    proxy.stop().await;
}

#[tokio::test]
async fn large_response_is_relayed_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let origin = MockOrigin::start(Reply::Body(body.clone())).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let request = get(&origin.url("/big.bin"), origin.addr.port());
    let fetched = send_raw(proxy.addr, &request).await;
    assert_eq!(fetched, ok_response(&body));

    let replayed = send_raw(proxy.addr, &request).await;
    assert_eq!(replayed, fetched);
    assert_eq!(origin.accepted(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn disabled_cache_always_contacts_origin() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Body(b"fresh".to_vec())).await;
    let mut config = test_config(dir.path());
    config.cache.enabled = false;
    let proxy = start_proxy(config).await;

    let request = get(&origin.url("/"), origin.addr.port());
    send_raw(proxy.addr, &request).await;
    send_raw(proxy.addr, &request).await;

    assert_eq!(origin.accepted(), 2);
    assert!(cache_files(dir.path()).is_empty());
    proxy.stop().await;
}

#[tokio::test]
async fn works_as_http_proxy_for_reqwest() {
    let dir = tempfile::tempdir().unwrap();
    let origin = MockOrigin::start(Reply::Body(b"via proxy".to_vec())).await;
    let proxy = start_proxy(test_config(dir.path())).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap())
        .build()
        .unwrap();

    let response = client.get(origin.url("/hello")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"via proxy");
    assert_eq!(origin.accepted(), 1);
    proxy.stop().await;
}
