mod common;

use common::{agent, eventually, ticket, FakeBackend};
use helpdesk_data::filters::{visible, AgentFilter, FilterAction, FilterStore};
use helpdesk_data::types::{TicketDraft, TicketEdit, TicketPriority, TicketQuery, TicketStatus};
use helpdesk_data::{ApiError, Freshness, HelpdeskQueries, QueryKey};

fn seeded() -> HelpdeskQueries<FakeBackend> {
    HelpdeskQueries::new(FakeBackend::new(
        vec![ticket(1, "VPN drops"), ticket(2, "Printer jam")],
        vec![agent(7, "Avery"), agent(8, "Blake")],
    ))
}

#[tokio::test]
async fn test_create_then_list_sees_new_ticket() {
    let queries = seeded();
    assert_eq!(queries.fetch_tickets(TicketQuery::all()).await.unwrap().len(), 2);

    let created = queries
        .create_ticket(
            &TicketDraft::new("Laptop won't boot", "sam@example.com", TicketPriority::High)
                .with_description("blue screen"),
        )
        .await
        .unwrap();
    assert_eq!(created.id, 3);
    assert_eq!(created.status, TicketStatus::Open);

    assert!(queries.tickets(TicketQuery::all()).is_stale());
    let tickets = queries.fetch_tickets(TicketQuery::all()).await.unwrap();
    assert_eq!(tickets.len(), 3);
    assert_eq!(queries.api().calls("list_tickets"), 2);
}

#[tokio::test]
async fn test_assign_refreshes_single_ticket() {
    let queries = seeded();
    let before = queries.fetch_ticket(2).await.unwrap();
    assert_eq!(before.agent_id, None);

    queries.assign_ticket(2, Some(7)).await.unwrap();

    let after = queries.fetch_ticket(2).await.unwrap();
    assert_eq!(after.agent_id, Some(7));
    assert_eq!(after.agent_name.as_deref(), Some("Avery"));
    assert_eq!(queries.api().calls("get_ticket"), 2);

    queries.assign_ticket(2, None).await.unwrap();
    let cleared = queries.fetch_ticket(2).await.unwrap();
    assert_eq!(cleared.agent_id, None);
    assert_eq!(cleared.agent_name, None);
}

#[tokio::test]
async fn test_failed_mutation_invalidates_nothing() {
    let queries = seeded();
    queries.fetch_tickets(TicketQuery::all()).await.unwrap();

    let err = queries.assign_ticket(2, Some(99)).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        queries.cache().state(&QueryKey::tickets(TicketQuery::all())).freshness,
        Freshness::Fresh
    );

    let err = queries
        .create_ticket(&TicketDraft::new("  ", "sam@example.com", TicketPriority::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
    assert_eq!(queries.api().calls("list_tickets"), 1);
}

#[tokio::test]
async fn test_mutations_invalidate_every_list_variant() {
    let queries = seeded();
    let open = TicketQuery {
        status: Some(TicketStatus::Open),
        ..TicketQuery::default()
    };
    queries.fetch_tickets(TicketQuery::all()).await.unwrap();
    queries.fetch_tickets(open.clone()).await.unwrap();
    queries.fetch_agents().await.unwrap();

    queries
        .update_ticket_status(1, TicketStatus::Resolved)
        .await
        .unwrap();

    assert!(queries.tickets(TicketQuery::all()).is_stale());
    let open_now = queries.fetch_tickets(open).await.unwrap();
    assert_eq!(open_now.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);
    // Agents are untouched by ticket mutations.
    assert_eq!(
        queries.cache().state(&QueryKey::Agents).freshness,
        Freshness::Fresh
    );
}

#[tokio::test]
async fn test_update_and_delete_flow() {
    let queries = seeded();
    queries.fetch_ticket(1).await.unwrap();

    let edited = queries
        .update_ticket(
            1,
            &TicketEdit {
                title: "VPN drops hourly".into(),
                description: "since the upgrade".into(),
                priority: TicketPriority::Critical,
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.priority, TicketPriority::Critical);
    assert_eq!(queries.fetch_ticket(1).await.unwrap().title, "VPN drops hourly");

    queries.delete_ticket(1).await.unwrap();
    let err = queries.fetch_ticket(1).await.unwrap_err();
    assert!(err.is_not_found());
    // The last good copy stays visible next to the error.
    let state = queries.cache().state(&QueryKey::Ticket(1));
    assert!(state.data.is_some());
    assert!(state.error.is_some());
}

#[tokio::test]
async fn test_create_agent_refreshes_agents() {
    let queries = seeded();
    assert_eq!(queries.fetch_agents().await.unwrap().len(), 2);

    let created = queries
        .create_agent(&helpdesk_data::types::AgentDraft::new("Casey", "casey@example.com"))
        .await
        .unwrap();
    assert_eq!(created.id, 9);

    let agents = queries.fetch_agents().await.unwrap();
    assert_eq!(agents.len(), 3);
    assert_eq!(queries.api().calls("list_agents"), 2);
}

#[tokio::test]
async fn test_observed_list_refetches_on_invalidation() {
    let queries = seeded();
    let mut observer = queries.observe_tickets(TicketQuery::all());

    loop {
        let state = observer.changed().await;
        if !state.is_fetching() && state.data.is_some() {
            break;
        }
    }

    queries.api().set_status(2, TicketStatus::InProgress);
    queries.invalidate_ticket_lists();

    eventually(|| {
        observer
            .state()
            .data
            .and_then(|r| r.into_tickets())
            .is_some_and(|tickets| tickets[1].status == TicketStatus::InProgress)
    })
    .await;
    assert_eq!(queries.api().calls("list_tickets"), 2);
}

#[tokio::test]
async fn test_visible_rows_follow_filter_store() {
    let queries = seeded();
    queries.assign_ticket(1, Some(8)).await.unwrap();
    let tickets = queries.fetch_tickets(TicketQuery::all()).await.unwrap();

    let filters = FilterStore::default();
    filters.dispatch(FilterAction::SetAgent(AgentFilter::Agent(8)));
    let rows = visible(&tickets, &filters.get());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].agent_name.as_deref(), Some("Blake"));

    filters.dispatch(FilterAction::SetAgent(AgentFilter::Unassigned));
    filters.dispatch(FilterAction::SetSearch("printer".into()));
    let rows = visible(&tickets, &filters.get());
    assert_eq!(rows.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);

    // The server-side part of the filter keys its own cache entry.
    let server_side = queries.fetch_tickets(filters.get().to_query()).await.unwrap();
    assert_eq!(server_side.len(), 1);
}
