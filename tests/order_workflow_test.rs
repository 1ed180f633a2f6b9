mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use workshop_core::{
    entities::{appointment, order},
    events::{Audience, Event},
    models::{HistoryAction, ItemKind, OrderStatus, UserRole},
    services::{
        history,
        orders::{AddItemInput, AssignStaffInput, CreateOrderInput, OrderFilter},
    },
    ServiceError,
};

use common::{at, test_config, TestContext};

fn order_for(vehicle_id: i32) -> CreateOrderInput {
    CreateOrderInput {
        vehicle_id,
        description: Some("Strange noise when braking".to_string()),
        mileage: None,
        scheduled_at: None,
    }
}

fn service_line(service_id: i32) -> AddItemInput {
    AddItemInput {
        service_id: Some(service_id),
        ..Default::default()
    }
}

#[tokio::test]
async fn client_order_starts_confirmed_and_notifies_staff() {
    let mut ctx = TestContext::new().await;

    let created = ctx
        .services
        .orders
        .create_order(order_for(ctx.seed.vehicle.id), ctx.client())
        .await
        .unwrap();

    assert_eq!(created.status, OrderStatus::Confirmed);
    assert_eq!(created.total_amount, Decimal::ZERO);
    assert_eq!(created.mileage, Some(ctx.seed.vehicle.mileage));
    assert!(created.completed_at.is_none());

    let entries = history::list(ctx.pool(), created.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, HistoryAction::OrderCreated);
    assert_eq!(entries[0].user_id, ctx.seed.client.id);

    let events = ctx.drain_events();
    assert_eq!(events.len(), 1);
    assert_matches!(
        &events[0],
        Event::OrderCreated { order_id, audience: Audience::Roles(roles), vehicle, .. }
            if *order_id == created.id
                && roles == &vec![UserRole::Admin, UserRole::Manager]
                && vehicle == "Toyota Corolla"
    );
}

#[tokio::test]
async fn staff_order_books_visit_and_notifies_owner() {
    let mut ctx = TestContext::new().await;
    let visit = at(2025, 6, 10, 10, 0);

    let created = ctx
        .services
        .orders
        .create_order(
            CreateOrderInput {
                mileage: Some(121_500),
                scheduled_at: Some(visit),
                ..order_for(ctx.seed.vehicle.id)
            },
            ctx.manager(),
        )
        .await
        .unwrap();
    assert_eq!(created.mileage, Some(121_500));

    let details = ctx.services.orders.get_order(created.id).await.unwrap();
    let booked = details.appointment.expect("appointment booked with the order");
    assert_eq!(booked.scheduled_at, visit);
    assert_eq!(booked.estimated_min, 60);

    let events = ctx.drain_events();
    assert_matches!(
        &events[..],
        [Event::OrderCreated { audience: Audience::Users(ids), .. }] if ids == &vec![ctx.seed.client.id]
    );
}

#[tokio::test]
async fn create_order_for_unknown_vehicle_fails() {
    let mut ctx = TestContext::new().await;

    let result = ctx
        .services
        .orders
        .create_order(order_for(9_999), ctx.manager())
        .await;

    assert_matches!(result, Err(ServiceError::NotFound(_)));
    assert_eq!(order::Entity::find().count(ctx.pool()).await.unwrap(), 0);
    assert!(ctx.drain_events().is_empty());
}

#[tokio::test]
async fn taken_slot_rolls_back_the_whole_order() {
    let ctx = TestContext::new().await;
    let visit = at(2025, 6, 10, 10, 0);
    let input = CreateOrderInput {
        scheduled_at: Some(visit),
        ..order_for(ctx.seed.vehicle.id)
    };

    ctx.services
        .orders
        .create_order(input.clone(), ctx.manager())
        .await
        .unwrap();
    let second = ctx.services.orders.create_order(input, ctx.manager()).await;

    assert_matches!(second, Err(ServiceError::Conflict(_)));
    assert_eq!(order::Entity::find().count(ctx.pool()).await.unwrap(), 1);
    assert_eq!(appointment::Entity::find().count(ctx.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn adding_and_removing_a_service_keeps_total_and_history_in_step() {
    let ctx = TestContext::new().await;
    let pending = ctx.insert_order(OrderStatus::Pending).await;

    let added = ctx
        .services
        .orders
        .add_item(pending.id, service_line(ctx.seed.oil_change.id), ctx.manager())
        .await
        .unwrap();
    assert_eq!(added.order.total_amount, dec!(500));
    assert_eq!(added.item.item_type, ItemKind::Service);
    assert_eq!(added.item.name, "Oil change");
    assert_eq!(added.item.quantity, 1);

    let after_remove = ctx
        .services
        .orders
        .remove_item(pending.id, added.item.id, ctx.manager())
        .await
        .unwrap();
    assert_eq!(after_remove.total_amount, Decimal::ZERO);

    let actions: Vec<_> = history::list(ctx.pool(), pending.id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(actions, vec![HistoryAction::ItemRemoved, HistoryAction::ItemAdded]);
}

#[tokio::test]
async fn total_is_rederived_from_the_remaining_lines() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::InProgress).await;
    let orders = &ctx.services.orders;

    orders
        .add_item(order.id, service_line(ctx.seed.oil_change.id), ctx.manager())
        .await
        .unwrap();
    let filters = orders
        .add_item(
            order.id,
            AddItemInput {
                part_id: Some(ctx.seed.oil_filter.id),
                quantity: Some(3),
                ..Default::default()
            },
            ctx.mechanic(),
        )
        .await
        .unwrap();
    assert_eq!(filters.item.item_type, ItemKind::Part);
    assert_eq!(filters.item.price, dec!(120.25));
    assert_eq!(filters.item.cost_price, Some(dec!(80)));

    let custom = orders
        .add_item(
            order.id,
            AddItemInput {
                name: Some("Diagnostics".to_string()),
                price: Some(dec!(99.5)),
                quantity: Some(2),
                mechanic_id: Some(ctx.seed.mechanic.id),
                ..Default::default()
            },
            ctx.manager(),
        )
        .await
        .unwrap();
    assert_eq!(custom.order.total_amount, dec!(1059.75));

    let after = orders
        .remove_item(order.id, filters.item.id, ctx.manager())
        .await
        .unwrap();
    assert_eq!(after.total_amount, dec!(699));
    assert_eq!(ctx.reload_order(order.id).await.total_amount, dec!(699));

    let details = orders.get_order(order.id).await.unwrap();
    assert_eq!(details.items.len(), 2);
    assert_eq!(details.history.len(), 4);
}

#[tokio::test]
async fn item_errors_leave_the_order_untouched() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;
    let other = ctx.insert_order(OrderStatus::Confirmed).await;
    let orders = &ctx.services.orders;

    assert_matches!(
        orders
            .add_item(9_999, service_line(ctx.seed.oil_change.id), ctx.manager())
            .await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        orders.add_item(order.id, service_line(9_999), ctx.manager()).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        orders
            .add_item(
                order.id,
                AddItemInput {
                    part_id: Some(9_999),
                    ..Default::default()
                },
                ctx.manager()
            )
            .await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        orders
            .add_item(
                order.id,
                AddItemInput {
                    quantity: Some(0),
                    ..service_line(ctx.seed.oil_change.id)
                },
                ctx.manager()
            )
            .await,
        Err(ServiceError::BadRequest(_))
    );
    assert_matches!(
        orders
            .add_item(
                order.id,
                AddItemInput {
                    name: Some("Mystery work".to_string()),
                    ..Default::default()
                },
                ctx.manager()
            )
            .await,
        Err(ServiceError::BadRequest(_))
    );

    let line = orders
        .add_item(other.id, service_line(ctx.seed.oil_change.id), ctx.manager())
        .await
        .unwrap();
    assert_matches!(
        orders.remove_item(order.id, line.item.id, ctx.manager()).await,
        Err(ServiceError::NotFound(_))
    );

    assert_eq!(ctx.reload_order(order.id).await.total_amount, Decimal::ZERO);
    assert_eq!(history::count(ctx.pool(), order.id).await.unwrap(), 0);
}

#[tokio::test]
async fn completion_time_is_stamped_once() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;
    let orders = &ctx.services.orders;

    orders
        .change_status(order.id, OrderStatus::InProgress, ctx.mechanic(), None)
        .await
        .unwrap();
    let completed = orders
        .change_status(order.id, OrderStatus::Completed, ctx.mechanic(), None)
        .await
        .unwrap();
    let first_completion = completed.completed_at.expect("completion stamped");
    assert_eq!(first_completion, common::start_of_tests());

    ctx.clock.advance(Duration::hours(3));
    let again = orders
        .change_status(order.id, OrderStatus::Completed, ctx.mechanic(), None)
        .await
        .unwrap();
    assert_eq!(again.completed_at, Some(first_completion));
    assert_eq!(history::count(ctx.pool(), order.id).await.unwrap(), 3);
}

#[tokio::test]
async fn status_change_is_recorded_with_labels() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::InProgress).await;

    ctx.services
        .orders
        .change_status(
            order.id,
            OrderStatus::WaitingParts,
            ctx.manager(),
            Some("Pads ordered".to_string()),
        )
        .await
        .unwrap();

    let entries = history::list(ctx.pool(), order.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.action, HistoryAction::StatusChange);
    assert_eq!(entry.old_value.as_deref(), Some("IN_PROGRESS"));
    assert_eq!(entry.new_value.as_deref(), Some("WAITING_PARTS"));
    assert_eq!(
        entry.comment.as_deref(),
        Some("Status changed: In progress → Waiting for parts. Pads ordered")
    );
}

#[tokio::test]
async fn undefined_transition_is_rejected_without_side_effects() {
    let mut ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;

    let result = ctx
        .services
        .orders
        .change_status(order.id, OrderStatus::Paid, ctx.manager(), None)
        .await;

    assert_matches!(result, Err(ServiceError::InvalidStatus(_)));
    assert_eq!(ctx.reload_order(order.id).await.status, OrderStatus::Confirmed);
    assert_eq!(history::count(ctx.pool(), order.id).await.unwrap(), 0);
    assert!(ctx.drain_events().is_empty());

    assert_matches!(
        ctx.services
            .orders
            .change_status(9_999, OrderStatus::Cancelled, ctx.manager(), None)
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn terminal_orders_stay_terminal() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;
    let orders = &ctx.services.orders;

    orders
        .change_status(order.id, OrderStatus::Cancelled, ctx.manager(), None)
        .await
        .unwrap();
    assert_matches!(
        orders
            .change_status(order.id, OrderStatus::InProgress, ctx.manager(), None)
            .await,
        Err(ServiceError::InvalidStatus(_))
    );
    assert_matches!(
        orders
            .change_status(order.id, OrderStatus::Cancelled, ctx.manager(), None)
            .await,
        Err(ServiceError::InvalidStatus(_))
    );
    assert_eq!(history::count(ctx.pool(), order.id).await.unwrap(), 1);
}

#[tokio::test]
async fn transition_table_can_be_switched_off() {
    let mut config = test_config();
    config.enforce_status_transitions = false;
    let ctx = TestContext::with_config(config).await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;

    let paid = ctx
        .services
        .orders
        .change_status(order.id, OrderStatus::Paid, ctx.manager(), None)
        .await
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
}

#[tokio::test]
async fn status_change_notifies_everyone_but_the_actor() {
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
            ctx.admin(),
        )
        .await
        .unwrap();
    ctx.drain_events();

    ctx.services
        .orders
        .change_status(order.id, OrderStatus::InProgress, ctx.mechanic(), None)
        .await
        .unwrap();

    let events = ctx.drain_events();
    assert_matches!(
        &events[..],
        [Event::OrderStatusChanged { recipients, old_status: OrderStatus::Confirmed, new_status: OrderStatus::InProgress, .. }]
            if recipients == &vec![ctx.seed.client.id, ctx.seed.manager.id]
    );
}

#[tokio::test]
async fn assigning_staff_records_one_entry_and_notifies_new_assignees() {
    let mut ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;

    let updated = ctx
        .services
        .orders
        .assign_staff(
            order.id,
            AssignStaffInput {
                manager_id: Some(ctx.seed.manager.id),
                mechanic_id: Some(ctx.seed.mechanic.id),
            },
            ctx.admin(),
        )
        .await
        .unwrap();
    assert_eq!(updated.manager_id, Some(ctx.seed.manager.id));
    assert_eq!(updated.mechanic_id, Some(ctx.seed.mechanic.id));

    let entries = history::list(ctx.pool(), order.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, HistoryAction::AssignmentChange);
    assert_eq!(
        entries[0].comment.as_deref(),
        Some("Manager: not assigned → Petro Manager; Mechanic: not assigned → Ivan Mechanic")
    );

    let assigned: Vec<_> = ctx
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            Event::StaffAssigned { user_id, role, .. } => Some((user_id, role)),
            _ => None,
        })
        .collect();
    assert_eq!(
        assigned,
        vec![
            (ctx.seed.manager.id, UserRole::Manager),
            (ctx.seed.mechanic.id, UserRole::Mechanic)
        ]
    );
}

#[tokio::test]
async fn self_assignment_is_not_announced() {
    let mut ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;

    ctx.services
        .orders
        .assign_staff(
            order.id,
            AssignStaffInput {
                manager_id: Some(ctx.seed.manager.id),
                mechanic_id: None,
            },
            ctx.manager(),
        )
        .await
        .unwrap();

    assert!(ctx.drain_events().is_empty());
    let entries = history::list(ctx.pool(), order.id).await.unwrap();
    assert_eq!(
        entries[0].comment.as_deref(),
        Some("Manager: not assigned → Petro Manager")
    );
}

#[tokio::test]
async fn assignment_validates_people_and_roles() {
    let ctx = TestContext::new().await;
    let order = ctx.insert_order(OrderStatus::Confirmed).await;
    let orders = &ctx.services.orders;

    assert_matches!(
        orders
            .assign_staff(order.id, AssignStaffInput::default(), ctx.admin())
            .await,
        Err(ServiceError::BadRequest(_))
    );
    assert_matches!(
        orders
            .assign_staff(
                order.id,
                AssignStaffInput {
                    manager_id: Some(ctx.seed.client.id),
                    mechanic_id: None,
                },
                ctx.admin()
            )
            .await,
        Err(ServiceError::BadRequest(_))
    );
    assert_matches!(
        orders
            .assign_staff(
                order.id,
                AssignStaffInput {
                    manager_id: None,
                    mechanic_id: Some(ctx.seed.manager.id),
                },
                ctx.admin()
            )
            .await,
        Err(ServiceError::BadRequest(_))
    );
    assert_matches!(
        orders
            .assign_staff(
                order.id,
                AssignStaffInput {
                    manager_id: Some(9_999),
                    mechanic_id: None,
                },
                ctx.admin()
            )
            .await,
        Err(ServiceError::NotFound(_))
    );

    let admin_as_manager = orders
        .assign_staff(
            order.id,
            AssignStaffInput {
                manager_id: Some(ctx.seed.admin.id),
                mechanic_id: None,
            },
            ctx.admin(),
        )
        .await
        .unwrap();
    assert_eq!(admin_as_manager.manager_id, Some(ctx.seed.admin.id));
    assert_eq!(history::count(ctx.pool(), order.id).await.unwrap(), 1);
}

#[tokio::test]
async fn list_orders_filters_and_sorts_newest_first() {
    let ctx = TestContext::new().await;
    let first = ctx.insert_order(OrderStatus::Confirmed).await;
    ctx.clock.advance(Duration::minutes(5));
    let second = ctx.insert_order(OrderStatus::Confirmed).await;
    ctx.clock.advance(Duration::minutes(5));
    let in_progress = ctx.insert_order(OrderStatus::InProgress).await;

    let all = ctx
        .services
        .orders
        .list_orders(OrderFilter::default())
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![in_progress.id, second.id, first.id]);

    let confirmed = ctx
        .services
        .orders
        .list_orders(OrderFilter {
            status: Some(OrderStatus::Confirmed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 2);

    let recent = ctx
        .services
        .orders
        .list_orders(OrderFilter {
            created_from: Some(common::start_of_tests() + Duration::minutes(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
}
