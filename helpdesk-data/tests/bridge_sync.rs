mod common;

use std::sync::Arc;

use serde_json::json;

use common::{agent, eventually, ticket, FakeBackend, ManualTransport};
use helpdesk_data::push::{ChannelState, TransportSignal};
use helpdesk_data::queries::ResourceObserver;
use helpdesk_data::types::{TicketQuery, TicketStatus};
use helpdesk_data::{
    ConnectionStore, EventKind, Freshness, HelpdeskQueries, PushChannel, QueryKey, SyncBridge,
};

fn seeded() -> HelpdeskQueries<FakeBackend> {
    HelpdeskQueries::new(FakeBackend::new(
        vec![ticket(1, "VPN drops"), ticket(5, "Printer jam")],
        vec![agent(7, "Avery")],
    ))
}

fn status_changed(id: i64, status: u8) -> TransportSignal {
    TransportSignal::Event {
        target: "TicketStatusChanged".into(),
        payload: json!({ "id": id, "status": status, "previousStatus": 0 }),
    }
}

fn created(id: i64) -> TransportSignal {
    TransportSignal::Event {
        target: "TicketCreated".into(),
        payload: json!({
            "id": id,
            "title": "Pushed",
            "status": 0,
            "priority": 0,
            "createdAt": "2025-03-02T10:00:00",
            "updatedAt": "2025-03-02T10:00:00"
        }),
    }
}

fn by_id(target: &str, id: i64) -> TransportSignal {
    TransportSignal::Event {
        target: target.into(),
        payload: json!({ "id": id }),
    }
}

/// Attach a bridge, start the channel and settle both ticket lists plus
/// tickets 1 and 5 under observation.
struct Observed {
    queries: HelpdeskQueries<FakeBackend>,
    tx: tokio::sync::mpsc::Sender<TransportSignal>,
    _channel: PushChannel<ManualTransport>,
    _bridge: SyncBridge<FakeBackend>,
    _observers: Vec<ResourceObserver>,
}

fn open_key() -> QueryKey {
    QueryKey::tickets(TicketQuery {
        status: Some(TicketStatus::Open),
        ..TicketQuery::default()
    })
}

async fn observed() -> Observed {
    let queries = seeded();
    let transport = ManualTransport::default();
    let tx = transport.link();
    let channel = PushChannel::new(transport);
    let bridge = SyncBridge::new(queries.clone(), Arc::new(ConnectionStore::default()));
    bridge.attach(&channel);
    channel.start().await.unwrap();

    let all = QueryKey::tickets(TicketQuery::all());
    let keys = [all, open_key(), QueryKey::Ticket(5), QueryKey::Ticket(1)];
    let observers = keys.iter().map(|key| queries.observe(key.clone())).collect();
    for key in &keys {
        settled(&queries, key).await;
    }
    assert_eq!(queries.api().calls("list_tickets"), 2);
    assert_eq!(queries.api().calls("get_ticket"), 2);

    Observed {
        queries,
        tx,
        _channel: channel,
        _bridge: bridge,
        _observers: observers,
    }
}

async fn settled(queries: &HelpdeskQueries<FakeBackend>, key: &QueryKey) {
    eventually(|| queries.cache().state(key).freshness == Freshness::Fresh).await;
}

#[tokio::test]
async fn test_status_change_refetches_ticket_and_every_observed_list() {
    let queries = seeded();
    let transport = ManualTransport::default();
    let tx = transport.link();
    let channel = PushChannel::new(transport);
    let bridge = SyncBridge::new(queries.clone(), Arc::new(ConnectionStore::default()));
    bridge.attach(&channel);
    channel.start().await.unwrap();

    let all = QueryKey::tickets(TicketQuery::all());
    let open = QueryKey::tickets(TicketQuery {
        status: Some(TicketStatus::Open),
        ..TicketQuery::default()
    });
    let _all = queries.observe(all.clone());
    let _open = queries.observe(open.clone());
    let _ticket = queries.observe(QueryKey::Ticket(5));
    let _other = queries.observe(QueryKey::Ticket(1));
    settled(&queries, &all).await;
    settled(&queries, &open).await;
    settled(&queries, &QueryKey::Ticket(5)).await;
    settled(&queries, &QueryKey::Ticket(1)).await;
    assert_eq!(queries.api().calls("list_tickets"), 2);
    assert_eq!(queries.api().calls("get_ticket"), 2);

    queries.api().set_status(5, TicketStatus::Resolved);
    tx.send(status_changed(5, 2)).await.unwrap();

    eventually(|| queries.api().calls("list_tickets") == 4).await;
    eventually(|| queries.api().calls("get_ticket") == 3).await;
    settled(&queries, &QueryKey::Ticket(5)).await;
    let refreshed = queries.ticket(5).data.unwrap();
    assert_eq!(refreshed.status, TicketStatus::Resolved);
    settled(&queries, &open).await;
    let open_rows = queries.tickets(TicketQuery {
        status: Some(TicketStatus::Open),
        ..TicketQuery::default()
    });
    assert_eq!(open_rows.data.unwrap().len(), 1);
    // Ticket 1 was not named by the event.
    assert_eq!(queries.api().calls("get_ticket"), 3);
}

#[tokio::test]
async fn test_updated_event_refetches_ticket_and_every_observed_list() {
    let Observed {
        queries,
        tx,
        _channel,
        _bridge,
        _observers,
    } = observed().await;

    queries.api().rename(5, "Printer on fire");
    tx.send(by_id("TicketUpdated", 5)).await.unwrap();

    eventually(|| queries.api().calls("list_tickets") == 4).await;
    eventually(|| queries.api().calls("get_ticket") == 3).await;
    settled(&queries, &QueryKey::Ticket(5)).await;
    assert_eq!(queries.ticket(5).data.unwrap().title, "Printer on fire");
    let all = QueryKey::tickets(TicketQuery::all());
    settled(&queries, &all).await;
    let rows = queries.tickets(TicketQuery::all()).data.unwrap();
    assert!(rows.iter().any(|t| t.id == 5 && t.title == "Printer on fire"));
    assert_eq!(queries.api().calls("get_ticket"), 3);
}

#[tokio::test]
async fn test_deleted_event_refetches_and_keeps_last_ticket_data() {
    let Observed {
        queries,
        tx,
        _channel,
        _bridge,
        _observers,
    } = observed().await;

    queries.api().remove(5);
    tx.send(by_id("TicketDeleted", 5)).await.unwrap();

    eventually(|| queries.api().calls("list_tickets") == 4).await;
    eventually(|| queries.api().calls("get_ticket") == 3).await;
    eventually(|| {
        queries
            .cache()
            .state(&QueryKey::Ticket(5))
            .error
            .is_some_and(|e| e.is_not_found())
    })
    .await;
    let gone = queries.cache().state(&QueryKey::Ticket(5));
    assert_eq!(gone.data.and_then(|r| r.into_ticket()).map(|t| t.id), Some(5));

    let all = QueryKey::tickets(TicketQuery::all());
    settled(&queries, &all).await;
    settled(&queries, &open_key()).await;
    let rows = queries.tickets(TicketQuery::all()).data.unwrap();
    assert_eq!(rows.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1]);
    assert_eq!(queries.api().calls("get_ticket"), 3);
}

#[tokio::test]
async fn test_restart_after_close_refreshes_tickets() {
    let queries = seeded();
    let transport = ManualTransport::default();
    let first = transport.link();
    let channel = PushChannel::new(transport);
    let connection = Arc::new(ConnectionStore::default());
    let bridge = SyncBridge::new(queries.clone(), Arc::clone(&connection));
    bridge.attach(&channel);
    channel.start().await.unwrap();

    let all = QueryKey::tickets(TicketQuery::all());
    let _list = queries.observe(all.clone());
    settled(&queries, &all).await;
    assert_eq!(queries.api().calls("list_tickets"), 1);

    first
        .send(TransportSignal::Closed(Some("retries exhausted".into())))
        .await
        .unwrap();
    eventually(|| channel.state() == ChannelState::Disconnected).await;

    // Created while nobody was listening.
    queries.api().insert(ticket(6, "Missed"));
    let _second = channel.transport().link();
    channel.start().await.unwrap();
    assert!(connection.get().connected);

    eventually(|| queries.api().calls("list_tickets") == 2).await;
    settled(&queries, &all).await;
    assert_eq!(queries.tickets(TicketQuery::all()).data.unwrap().len(), 3);
}

#[tokio::test]
async fn test_created_event_only_touches_lists() {
    let queries = seeded();
    let transport = ManualTransport::default();
    let tx = transport.link();
    let channel = PushChannel::new(transport);
    let bridge = SyncBridge::new(queries.clone(), Arc::new(ConnectionStore::default()));
    bridge.attach(&channel);
    channel.start().await.unwrap();

    let all = QueryKey::tickets(TicketQuery::all());
    let _list = queries.observe(all.clone());
    let _one = queries.observe(QueryKey::Ticket(1));
    settled(&queries, &all).await;
    settled(&queries, &QueryKey::Ticket(1)).await;

    queries.api().insert(ticket(6, "Pushed"));
    tx.send(created(6)).await.unwrap();

    eventually(|| queries.api().calls("list_tickets") == 2).await;
    settled(&queries, &all).await;
    assert_eq!(queries.tickets(TicketQuery::all()).data.unwrap().len(), 3);
    assert_eq!(queries.api().calls("get_ticket"), 1);
}

#[tokio::test]
async fn test_attach_twice_registers_once() {
    let queries = seeded();
    let channel = PushChannel::new(ManualTransport::default());
    let bridge = SyncBridge::new(queries, Arc::new(ConnectionStore::default()));

    bridge.attach(&channel);
    bridge.attach(&channel);
    for kind in EventKind::ALL {
        assert_eq!(channel.handler_count(kind), 1);
    }
    assert_eq!(channel.hook_count(), 3);

    bridge.detach();
    bridge.detach();
    assert!(!bridge.is_attached());
    assert_eq!(channel.handler_count(EventKind::TicketCreated), 0);
    assert_eq!(channel.hook_count(), 0);
}

#[tokio::test]
async fn test_reattach_while_down_still_refreshes_on_reconnect() {
    let queries = seeded();
    let transport = ManualTransport::default();
    let tx = transport.link();
    let channel = PushChannel::new(transport);
    let connection = Arc::new(ConnectionStore::default());
    let bridge = SyncBridge::new(queries.clone(), Arc::clone(&connection));
    bridge.attach(&channel);
    channel.start().await.unwrap();

    let all = QueryKey::tickets(TicketQuery::all());
    let _list = queries.observe(all.clone());
    settled(&queries, &all).await;

    tx.send(TransportSignal::Reconnecting(None)).await.unwrap();
    eventually(|| connection.get().reconnecting).await;

    bridge.attach(&channel);
    assert_eq!(channel.hook_count(), 3);

    tx.send(TransportSignal::Reconnected).await.unwrap();
    eventually(|| connection.get().connected).await;
    eventually(|| queries.api().calls("list_tickets") == 2).await;
}

#[tokio::test]
async fn test_dropping_bridge_detaches_it() {
    let channel = PushChannel::new(ManualTransport::default());
    {
        let bridge = SyncBridge::new(seeded(), Arc::new(ConnectionStore::default()));
        bridge.attach(&channel);
        assert_eq!(channel.handler_count(EventKind::TicketDeleted), 1);
    }
    assert_eq!(channel.handler_count(EventKind::TicketDeleted), 0);
    assert_eq!(channel.hook_count(), 0);
}

#[tokio::test]
async fn test_lifecycle_relayed_into_connection_state() {
    let queries = seeded();
    let transport = ManualTransport::default();
    let tx = transport.link();
    let channel = PushChannel::new(transport);
    let connection = Arc::new(ConnectionStore::default());
    let bridge = SyncBridge::new(queries.clone(), Arc::clone(&connection));
    bridge.attach(&channel);

    channel.start().await.unwrap();
    assert!(connection.get().connected);

    let all = QueryKey::tickets(TicketQuery::all());
    let _list = queries.observe(all.clone());
    let _one = queries.observe(QueryKey::Ticket(1));
    settled(&queries, &all).await;
    settled(&queries, &QueryKey::Ticket(1)).await;

    tx.send(TransportSignal::Reconnecting(Some("socket reset".into())))
        .await
        .unwrap();
    eventually(|| connection.get().reconnecting).await;
    assert!(!connection.get().connected);
    assert_eq!(connection.get().last_error.as_deref(), Some("socket reset"));

    // Coming back refreshes lists and single tickets alike.
    tx.send(TransportSignal::Reconnected).await.unwrap();
    eventually(|| connection.get().connected).await;
    assert_eq!(connection.get().last_error, None);
    eventually(|| {
        queries.api().calls("list_tickets") == 2 && queries.api().calls("get_ticket") == 2
    })
    .await;

    tx.send(TransportSignal::Closed(Some("retries exhausted".into())))
        .await
        .unwrap();
    eventually(|| channel.state() == ChannelState::Disconnected).await;
    let state = connection.get();
    assert!(!state.connected && !state.reconnecting);
    assert_eq!(state.last_error.as_deref(), Some("retries exhausted"));
}

#[tokio::test]
async fn test_failed_start_is_reported_as_offline() {
    let channel = PushChannel::new(ManualTransport::default());
    let connection = Arc::new(ConnectionStore::default());
    let bridge = SyncBridge::new(seeded(), Arc::clone(&connection));
    bridge.attach(&channel);

    assert!(channel.start().await.is_err());
    let state = connection.get();
    assert!(!state.connected && !state.reconnecting);
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("no link queued")));
    assert_eq!(channel.transport().connect_count(), 1);
}
