
use harness::{http_request, request_over, tls_connect, HttpBackend, ProxyHandle};

#[tokio::test]
async fn wildcard_certificate_covers_subdomains() {
    let generated =
        rcgen::generate_simple_self_signed(vec!["*.example.test".to_string()]).unwrap();
    let cert_pem = generated.cert.pem();
    let key_pem = generated.key_pair.serialize_pem();

    let backend = HttpBackend::spawn("tls-backend").await.unwrap();

    let proxy = ProxyHandle::spawn().await;
    proxy.add_certificate("*.example.test", &cert_pem, &key_pem);
    proxy.add_route("api.example.test", &[("id-tls", backend.addr)]);

    // The client trusts only the wildcard cert; a successful handshake for
    // api.example.test proves the wildcard lookup selected it.
    let stream = tls_connect(proxy.https_addr, "api.example.test", generated.cert.der())
        .await
        .unwrap();

    let (status, _, body) = request_over(
        stream,
        "GET",
        "api.example.test",
        "/",
        &[],
        Vec::new(),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(&body[..], b"tls-backend");
}

#[tokio::test]
async fn exact_name_beats_the_wildcard() {
    let wildcard =
        rcgen::generate_simple_self_signed(vec!["*.example.test".to_string()]).unwrap();
    let exact =
        rcgen::generate_simple_self_signed(vec!["api.example.test".to_string()]).unwrap();

    let proxy = ProxyHandle::spawn().await;
    proxy.add_certificate(
        "*.example.test",
        &wildcard.cert.pem(),
        &wildcard.key_pair.serialize_pem(),
    );
    proxy.add_certificate(
        "api.example.test",
        &exact.cert.pem(),
        &exact.key_pair.serialize_pem(),
    );

    // Trusting only the exact cert works iff the resolver preferred it.
    let connected = tls_connect(proxy.https_addr, "api.example.test", exact.cert.der()).await;
    assert!(connected.is_ok());

    // Trusting only the wildcard must now fail for this name.
    let rejected = tls_connect(proxy.https_addr, "api.example.test", wildcard.cert.der()).await;
    assert!(rejected.is_err());
}

#[tokio::test]
async fn sni_names_match_case_insensitively() {
    let generated =
        rcgen::generate_simple_self_signed(vec!["upper.example.test".to_string()]).unwrap();

    let proxy = ProxyHandle::spawn().await;
    // CN annotations may arrive in any case; the store normalizes.
    proxy.add_certificate(
        "UPPER.Example.Test",
        &generated.cert.pem(),
        &generated.key_pair.serialize_pem(),
    );

    let connected = tls_connect(proxy.https_addr, "upper.example.test", generated.cert.der()).await;
    assert!(connected.is_ok());
}

#[tokio::test]
async fn unknown_sni_is_served_the_placeholder() {
    let proxy = ProxyHandle::spawn().await;

    // No synced certificate matches "localhost"; the handshake succeeds only
    // because the placeholder is served, and the request then fails routing.
    let stream = tls_connect(proxy.https_addr, "localhost", &proxy.placeholder_der)
        .await
        .unwrap();

    let (status, _, _) = request_over(stream, "GET", "localhost", "/", &[], Vec::new()).await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn plain_listener_still_serves_hosts_with_certificates() {
    let generated =
        rcgen::generate_simple_self_signed(vec!["both.example.test".to_string()]).unwrap();
    let backend = HttpBackend::spawn("both-backend").await.unwrap();

    let proxy = ProxyHandle::spawn().await;
    proxy.add_certificate(
        "both.example.test",
        &generated.cert.pem(),
        &generated.key_pair.serialize_pem(),
    );
    proxy.add_route("both.example.test", &[("id-both", backend.addr)]);

    let (status, _, body) = http_request(
        proxy.http_addr,
        "GET",
        "both.example.test",
        "/",
        &[],
        Vec::new(),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(&body[..], b"both-backend");
}
