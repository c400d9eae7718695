// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

mod common;

use std::{collections::BTreeSet, time::Duration};

use common::{Fixture, keys, text};
use shardstream_core::{Error, FieldValue, ShardId, StreamWarning};
use shardstream_testing::SubscriberProbe;

fn names(tables: &[&str]) -> Option<BTreeSet<String>> {
	Some(tables.iter().map(|t| t.to_string()).collect())
}

#[test]
fn test_subscribe_table_while_streaming() {
	let fixture = Fixture::new(4, 1);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	fixture.put_order("o1", 1);
	fixture.put_user("u1", "ann");
	probe.wait_for_rows(1);

	handle.subscribe_table("orders").unwrap();
	probe.wait_for_change_results(1);
	assert_eq!(probe.change_results(), vec![("orders".to_string(), Ok(()))]);
	assert_eq!(handle.subscribed_tables(), names(&["orders", "users"]));

	fixture.put_order("o2", 2);
	probe.wait_for_rows(2);
	probe.assert_quiet(Duration::from_millis(50));
	let rows = probe.rows();
	assert_eq!(keys(&rows), vec!["u1", "o2"]);
	assert_eq!(rows[1].value("amount"), Some(&FieldValue::Integer(2)));
	handle.cancel();
}

#[test]
fn test_unsubscribe_table() {
	let fixture = Fixture::new(4, 1);
	let config = fixture.config("feed").tables(["users", "orders"]).build().unwrap();
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(config, &probe);

	fixture.put_order("o1", 1);
	probe.wait_for_rows(1);

	handle.unsubscribe_table("orders").unwrap();
	probe.wait_for_change_results(1);
	assert!(probe.change_results()[0].1.is_ok());
	assert_eq!(handle.subscribed_tables(), names(&["users"]));

	fixture.put_order("o2", 2);
	fixture.put_user("u1", "ann");
	probe.wait_for_rows(2);
	probe.assert_quiet(Duration::from_millis(50));
	assert_eq!(keys(&probe.rows()), vec!["o1", "u1"]);
	handle.cancel();
}

#[test]
fn test_table_changes_are_validated() {
	let fixture = Fixture::new(4, 1);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	assert!(matches!(handle.subscribe_table("users"), Err(Error::ChangeRejected(_))));
	assert!(matches!(handle.unsubscribe_table("orders"), Err(Error::ChangeRejected(_))));

	handle.subscribe_table("missing").unwrap();
	probe.wait_for_change_results(1);
	assert_eq!(probe.change_results()[0], ("missing".to_string(), Err(Error::TableNotFound("missing".to_string()))));
	assert_eq!(handle.subscribed_tables(), names(&["users"]));
	handle.cancel();
}

#[test]
fn test_wildcard_subscription_cannot_change_tables() {
	let fixture = Fixture::new(4, 1);
	let config = fixture.config("feed").all_tables().build().unwrap();
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(config, &probe);

	assert!(matches!(handle.subscribe_table("orders"), Err(Error::ChangeRejected(_))));
	assert!(matches!(handle.unsubscribe_table("users"), Err(Error::ChangeRejected(_))));

	fixture.put_user("u1", "ann");
	fixture.put_order("o1", 1);
	probe.wait_for_rows(2);
	assert_eq!(handle.subscribed_tables(), None);
	handle.cancel();
}

#[test]
fn test_rejected_change_is_rolled_back() {
	let fixture = Fixture::new(4, 2);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);
	fixture.put_user(&common::user_id_on(&fixture, ShardId(1), "a"), "ann");
	fixture.put_user(&common::user_id_on(&fixture, ShardId(2), "b"), "bob");
	probe.wait_for_rows(2);

	fixture.store.reject_filter_changes(ShardId(2), true);
	handle.subscribe_table("orders").unwrap();
	probe.wait_for_change_results(1);
	assert!(matches!(probe.change_results()[0].1, Err(Error::ChangeRejected(_))));
	assert_eq!(handle.subscribed_tables(), names(&["users"]));

	// shard 1 accepted the change first and must have dropped it again
	let order = (0..100).map(|i| format!("o{}", i)).find(|id| {
		fixture.store.shard_of(&fixture.orders.key::<&str, _>(&[], &[id.as_str()])) == ShardId(1)
	});
	fixture.put_order(&order.unwrap(), 1);
	fixture.put_user("u9", "zed");
	probe.wait_for_rows(3);
	probe.assert_quiet(Duration::from_millis(50));
	assert!(probe.rows().iter().all(|row| row.table == "users"));
	handle.cancel();
}

fn order_id_on(fixture: &Fixture, shard: ShardId) -> String {
	(0..100)
		.map(|i| format!("o{}", i))
		.find(|id| fixture.store.shard_of(&fixture.orders.key::<&str, _>(&[], &[id.as_str()])) == shard)
		.unwrap()
}

#[test]
fn test_records_passing_before_every_shard_answers_are_delivered() {
	let fixture = Fixture::new(4, 2);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);
	fixture.put_user(&common::user_id_on(&fixture, ShardId(1), "a"), "ann");
	probe.wait_for_rows(1);

	fixture.store.delay_filter_changes(ShardId(2), Duration::from_millis(600));
	handle.subscribe_table("orders").unwrap();
	// shard 1 passes orders while shard 2 is still applying the change
	std::thread::sleep(Duration::from_millis(200));
	let order = order_id_on(&fixture, ShardId(1));
	fixture.put_order(&order, 5);

	probe.wait_for_rows(2);
	probe.wait_for_change_results(1);
	assert_eq!(probe.change_results(), vec![("orders".to_string(), Ok(()))]);
	let rows = probe.rows();
	assert_eq!(rows[1].table, "orders");
	assert_eq!(keys(&rows)[1], order);
	assert_eq!(handle.statistics().skipped_unsubscribed, 0);
	handle.cancel();
}

#[test]
fn test_failed_add_forgets_staged_table() {
	let fixture = Fixture::new(4, 2);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	fixture.store.delay_filter_changes(ShardId(2), Duration::from_millis(300));
	fixture.store.reject_filter_changes(ShardId(2), true);
	handle.subscribe_table("orders").unwrap();
	probe.wait_for_change_results(1);
	assert!(matches!(probe.change_results()[0].1, Err(Error::ChangeRejected(_))));

	fixture.store.delay_filter_changes(ShardId(2), Duration::ZERO);
	fixture.put_order(&order_id_on(&fixture, ShardId(1)), 1);
	fixture.put_user("u9", "zed");
	probe.wait_for_rows(1);
	probe.assert_quiet(Duration::from_millis(50));
	assert!(probe.rows().iter().all(|row| row.table == "users"));
	handle.cancel();
}

#[test]
fn test_changes_beyond_pool_are_rejected() {
	let fixture = Fixture::new(4, 1);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	fixture.store.delay_filter_changes(ShardId(1), Duration::from_millis(300));
	handle.subscribe_table("orders").unwrap();
	handle.subscribe_table("missing").unwrap();
	assert_eq!(
		handle.subscribe_table("other"),
		Err(Error::ChangeRejected("2 table changes already pending".to_string()))
	);

	probe.wait_for_change_results(2);
	let results = probe.change_results();
	assert_eq!(results[0], ("orders".to_string(), Ok(())));
	assert_eq!(results[1], ("missing".to_string(), Err(Error::TableNotFound("missing".to_string()))));
	assert_eq!(handle.subscribed_tables(), names(&["orders", "users"]));

	// the rejected table is not left half added
	handle.subscribe_table("other").unwrap();
	probe.wait_for_change_results(3);
	assert_eq!(probe.change_results()[2], ("other".to_string(), Err(Error::TableNotFound("other".to_string()))));
	handle.cancel();
}

#[test]
fn test_schema_change_is_picked_up() {
	let fixture = Fixture::new(4, 1);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	let altered = fixture.catalog.add_columns("users", &["email"]).unwrap();
	fixture.catalog.fail_refreshes(1);
	fixture
		.store
		.begin()
		.put_versioned(&fixture.users, &["u1"], altered.version, &[text("ann"), text("ann@example.com")])
		.commit();
	probe.wait_for_rows(1);

	let rows = probe.rows();
	assert_eq!(rows[0].value("email"), Some(&text("ann@example.com")));
	assert_eq!(handle.statistics().schema_refreshes, 1);
	handle.cancel();
}

#[test]
fn test_dropped_table_is_reported() {
	let fixture = Fixture::new(4, 1);
	let probe = SubscriberProbe::new(1000);
	let handle = fixture.subscribe(fixture.config("feed").build().unwrap(), &probe);

	fixture.catalog.drop_table("users").unwrap();
	fixture.store.begin().put_versioned(&fixture.users, &["u1"], 2, &[text("ann")]).commit();
	probe.wait_for_warning(|w| {
		*w == StreamWarning::TableDropped {
			table: "users".to_string(),
		}
	});
	assert!(probe.operations().is_empty());
	assert!(probe.error().is_none());
	handle.cancel();
}

#[test]
fn test_unknown_table_fails_subscribe() {
	let fixture = Fixture::new(4, 1);
	let config = fixture.config("feed").tables(["users", "missing"]).build().unwrap();
	let result = shardstream_cdc::subscribe(config, fixture.sources(), SubscriberProbe::new(1));
	assert!(matches!(result, Err(Error::TableNotFound(table)) if table == "missing"));
}
