mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use workshop_core::{
    events::{self, Event},
    models::{NotificationType, OrderStatus, UserRole},
    notifications::{NotificationError, NotificationGateway, NotificationMessage},
    services::orders::AssignStaffInput,
};

use common::{RecordingGateway, TestContext};

/// Runs the worker over everything published so far and waits for it to finish
async fn deliver_pending(ctx: &mut TestContext, gateway: Arc<dyn NotificationGateway>) {
    let pending = ctx.drain_events();
    let (sender, rx) = events::channel(pending.len().max(1));
    for event in pending {
        sender.send(event).unwrap();
    }
    drop(sender);
    events::process_events(rx, gateway).await;
}

#[tokio::test]
async fn status_change_lands_in_every_inbox_but_the_actors() {
    let mut ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;
    ctx.services
        .orders
        .assign_staff(
            order.id,
            AssignStaffInput {
                manager_id: Some(ctx.seed.manager.id),
                mechanic_id: Some(ctx.seed.mechanic.id),
            },
            ctx.manager(),
        )
        .await
        .unwrap();
    ctx.services
        .orders
        .change_status(order.id, OrderStatus::InProgress, ctx.mechanic(), None)
        .await
        .unwrap();

    let inbox = ctx.services.notifications.clone();
    deliver_pending(&mut ctx, inbox.clone()).await;

    let client_inbox = inbox.list_for_user(ctx.seed.client.id, 10).await.unwrap();
    assert_eq!(client_inbox.len(), 1);
    assert_eq!(client_inbox[0].notification_type, NotificationType::StatusChanged);
    assert_eq!(client_inbox[0].message, format!("Order #{}: In progress", order.id));
    assert_eq!(client_inbox[0].order_id, Some(order.id));

    // the mechanic made the change, so only the assignment notice reaches them
    let mechanic_inbox = inbox.list_for_user(ctx.seed.mechanic.id, 10).await.unwrap();
    assert_eq!(mechanic_inbox.len(), 1);
    assert_eq!(mechanic_inbox[0].notification_type, NotificationType::Assignment);

    let manager_inbox = inbox.list_for_user(ctx.seed.manager.id, 10).await.unwrap();
    assert_eq!(manager_inbox.len(), 1);
    assert_eq!(manager_inbox[0].notification_type, NotificationType::StatusChanged);
}

#[tokio::test]
async fn role_audiences_reach_active_staff_only() {
    let mut ctx = TestContext::new().await;

    ctx.services
        .inventory
        .report_missing(ctx.seed.brake_pads.id, ctx.mechanic(), None)
        .await
        .unwrap();

    let inbox = ctx.services.notifications.clone();
    deliver_pending(&mut ctx, inbox.clone()).await;

    for staff in [&ctx.seed.admin, &ctx.seed.manager] {
        let received = inbox.list_for_user(staff.id, 10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].notification_type, NotificationType::Inventory);
        assert_eq!(received[0].title, "Part missing");
    }
    assert!(inbox
        .list_for_user(ctx.seed.mechanic.id, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(inbox
        .list_for_user(ctx.seed.client.id, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn inbox_read_state() {
    let ctx = TestContext::new().await;
    let inbox = ctx.services.notifications.clone();
    let client = ctx.seed.client.id;
    let message = NotificationMessage::new("Hello", "Your car is ready", NotificationType::System, None);

    inbox.notify(client, &message).await.unwrap();
    inbox.notify_many(&[client, ctx.seed.manager.id], &message).await.unwrap();
    assert_eq!(inbox.unread_count(client).await.unwrap(), 2);

    let newest = inbox.list_for_user(client, 1).await.unwrap();
    assert_eq!(newest.len(), 1);
    let read = inbox.mark_read(client, newest[0].id).await.unwrap();
    assert!(read.is_read);
    assert_eq!(inbox.unread_count(client).await.unwrap(), 1);

    assert_matches!(
        inbox.mark_read(ctx.seed.manager.id, newest[0].id).await,
        Err(NotificationError::NotFound(_))
    );

    assert_eq!(inbox.mark_all_read(client).await.unwrap(), 1);
    assert_eq!(inbox.unread_count(client).await.unwrap(), 0);
    assert_eq!(inbox.unread_count(ctx.seed.manager.id).await.unwrap(), 1);
}

#[tokio::test]
async fn delivery_failures_do_not_undo_the_workflow() {
    let mut ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;

    ctx.services
        .orders
        .change_status(order.id, OrderStatus::Cancelled, ctx.manager(), None)
        .await
        .unwrap();

    let gateway = Arc::new(RecordingGateway::failing());
    deliver_pending(&mut ctx, gateway.clone()).await;

    assert!(gateway.user_deliveries().is_empty());
    assert_eq!(ctx.reload_order(order.id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn batched_and_single_deliveries() {
    let gateway = Arc::new(RecordingGateway::default());
    let (sender, rx) = events::channel(8);
    sender.publish(Event::OrderStatusChanged {
        order_id: 1,
        old_status: OrderStatus::Confirmed,
        new_status: OrderStatus::InProgress,
        recipients: vec![3, 4],
    });
    sender.publish(Event::StaffAssigned {
        order_id: 1,
        user_id: 4,
        role: UserRole::Mechanic,
    });
    sender.publish(Event::OrderStatusChanged {
        order_id: 1,
        old_status: OrderStatus::InProgress,
        new_status: OrderStatus::Completed,
        recipients: vec![],
    });
    drop(sender);

    events::process_events(rx, gateway.clone()).await;

    let deliveries = gateway.user_deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].0, vec![3, 4]);
    assert_eq!(deliveries[1].0, vec![4]);
    assert_eq!(deliveries[1].1.title, "You were assigned as mechanic");
}
