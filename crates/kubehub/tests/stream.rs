use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::core::WatchEvent;
use skiff_kubehub::forward;

fn pod(name: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod
}

#[tokio::test]
async fn forward_delivers_events_in_order() {
    let events: Vec<kube::Result<WatchEvent<Pod>>> = vec![
        Ok(WatchEvent::Added(pod("a"))),
        Ok(WatchEvent::Modified(pod("a"))),
        Ok(WatchEvent::Deleted(pod("a"))),
    ];
    let mut handle = forward(futures::stream::iter(events).boxed());

    let mut seen = Vec::new();
    while let Some(event) = handle.rx.recv().await {
        seen.push(match event {
            WatchEvent::Added(p) => format!("added:{}", p.metadata.name.unwrap()),
            WatchEvent::Modified(p) => format!("modified:{}", p.metadata.name.unwrap()),
            WatchEvent::Deleted(p) => format!("deleted:{}", p.metadata.name.unwrap()),
            other => panic!("unexpected event {other:?}"),
        });
    }
    assert_eq!(seen, vec!["added:a", "modified:a", "deleted:a"]);
}

#[tokio::test]
async fn transport_errors_close_the_channel() {
    let events: Vec<kube::Result<WatchEvent<Pod>>> = vec![
        Ok(WatchEvent::Added(pod("a"))),
        Err(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        })),
        Ok(WatchEvent::Added(pod("b"))),
    ];
    let mut handle = forward(futures::stream::iter(events).boxed());

    assert!(matches!(
        handle.rx.recv().await,
        Some(WatchEvent::Added(_))
    ));
    // The error ends the stream; "b" is never delivered.
    assert!(handle.rx.recv().await.is_none());
}

#[tokio::test]
async fn cancel_stops_the_stream() {
    let events: Vec<kube::Result<WatchEvent<Pod>>> =
        (0..1000).map(|i| Ok(WatchEvent::Added(pod(&format!("p{i}"))))).collect();
    let handle = forward(futures::stream::iter(events).boxed());
    handle.cancel.cancel();
    let mut rx = handle.rx;
    // Drain whatever was buffered before the cancel took effect; the channel
    // must close rather than deliver all 1000 events.
    let mut count = 0;
    while rx.recv().await.is_some() {
        count += 1;
    }
    assert!(count < 1000);
}
