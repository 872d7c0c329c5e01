use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Days, Utc};
use tokio::net::TcpListener;
use tokio_postgres::SimpleQueryMessage;
use ulid::Ulid;

use pawbook::tenant::TenantManager;
use pawbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("pawbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "pawbook".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = tokio_postgres::Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("test_{}", Ulid::new()))
        .user("pawbook")
        .password("pawbook");

    let (client, connection) = config.connect(tokio_postgres::NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Run a query and keep only the data rows.
async fn query_rows(
    client: &tokio_postgres::Client,
    sql: &str,
) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Location open around the clock, every day, so wall-clock-relative
/// bookings always land inside opening hours.
async fn setup_always_open_location(client: &tokio_postgres::Client) -> Ulid {
    let location = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO locations (id, name) VALUES ('{location}', 'Round-the-Clock Kennel')"
        ))
        .await
        .unwrap();
    for weekday in 0..7 {
        client
            .simple_query(&format!(
                "INSERT INTO rules (id, location_id, staff_id, kind, weekday, date, start_minute, end_minute) \
                 VALUES ('{}', '{location}', NULL, 'available', {weekday}, NULL, 0, 1440)",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    location
}

/// Noon UTC a few days out — aligned to the 30-minute grid and far
/// beyond the cancellation notice window.
fn far_start_ms(days_ahead: u64) -> (String, i64) {
    let date = Utc::now().date_naive() + Days::new(days_ahead);
    let ms = date.and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp_millis();
    (date.to_string(), ms)
}

/// Grid-aligned start roughly two hours from now — inside the
/// cancellation notice window.
fn near_start_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let step = 30 * 60_000;
    ((now + 2 * 3_600_000) / step) * step
}

const ITEMS: &str = r#"[{"name":"Full Groom","duration_minutes":60,"price_cents":6500}]"#;
const SHORT_ITEMS: &str = r#"[{"name":"Nail Trim","duration_minutes":30,"price_cents":1500}]"#;

async fn insert_booking(
    client: &tokio_postgres::Client,
    location: Ulid,
    start: i64,
    items: &str,
) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO bookings (id, location_id, staff_id, customer_id, start, items, channel) \
             VALUES ('{id}', '{location}', NULL, '{}', {start}, '{items}', 'manual')",
            Ulid::new()
        ))
        .await?;
    Ok(id)
}

async fn slot_starts(client: &tokio_postgres::Client, location: Ulid, date: &str) -> Vec<i64> {
    query_rows(
        client,
        &format!(
            "SELECT * FROM time_slots WHERE location_id = '{location}' \
             AND duration = 60 AND date = '{date}'"
        ),
    )
    .await
    .iter()
    .map(|r| r.get("start").unwrap().parse::<i64>().unwrap())
    .collect()
}

fn db_message(err: tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.message().to_string())
        .unwrap_or_else(|| err.to_string())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_end_to_end() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = setup_always_open_location(&client).await;
    let (date, start) = far_start_ms(3);

    // Slots are offered for the target date, tagged with times.
    let rows = query_rows(
        &client,
        &format!(
            "SELECT * FROM time_slots WHERE location_id = '{location}' \
             AND duration = 60 AND date = '{date}'"
        ),
    )
    .await;
    assert!(!rows.is_empty());
    let noon = rows
        .iter()
        .find(|r| r.get("start").unwrap() == start.to_string())
        .expect("noon slot offered");
    assert_eq!(noon.get("time").unwrap(), "12:00");
    assert_eq!(noon.get("period").unwrap(), "afternoon");

    // Book noon; the slot disappears.
    let booking = insert_booking(&client, location, start, ITEMS).await.unwrap();
    assert!(!slot_starts(&client, location, &date).await.contains(&start));

    // A second booking for the same window loses.
    let err = insert_booking(&client, location, start, ITEMS).await.unwrap_err();
    assert!(db_message(err).contains("not available"));

    // Reschedule two hours later, then verify the stored row moved.
    client
        .simple_query(&format!(
            "UPDATE bookings SET start = {} WHERE id = '{booking}'",
            start + 2 * 3_600_000
        ))
        .await
        .unwrap();
    let rows = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{location}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("start").unwrap(),
        (start + 2 * 3_600_000).to_string()
    );
    assert_eq!(rows[0].get("status").unwrap(), "confirmed");

    // Cancel with days of notice; status flips, record stays.
    client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'cancelled', cancellation_reason = 'trip' \
             WHERE id = '{booking}'"
        ))
        .await
        .unwrap();
    let rows = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{location}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status").unwrap(), "cancelled");
    assert_eq!(rows[0].get("cancellation_reason").unwrap(), "trip");

    // Cancelling again reports failure, not silent success.
    let err = client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'cancelled' WHERE id = '{booking}'"
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("cannot be modified"));
}

#[tokio::test]
async fn reschedule_onto_taken_slot_fails_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = setup_always_open_location(&client).await;
    let (_, start) = far_start_ms(4);

    let mover = insert_booking(&client, location, start, ITEMS).await.unwrap();
    let _holder = insert_booking(&client, location, start + 3 * 3_600_000, ITEMS)
        .await
        .unwrap();

    let err = client
        .simple_query(&format!(
            "UPDATE bookings SET start = {} WHERE id = '{mover}'",
            start + 3 * 3_600_000
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("not available"));

    // Original start unchanged.
    let rows = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{location}'"),
    )
    .await;
    let mover_row = rows
        .iter()
        .find(|r| r.get("id").unwrap() == mover.to_string())
        .unwrap();
    assert_eq!(mover_row.get("start").unwrap(), start.to_string());
}

#[tokio::test]
async fn short_notice_cancellation_rejected_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = setup_always_open_location(&client).await;

    let start = near_start_ms();
    let booking = insert_booking(&client, location, start, SHORT_ITEMS)
        .await
        .unwrap();

    let err = client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'cancelled' WHERE id = '{booking}'"
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("cancellation window expired"));

    // Still on the books.
    let rows = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{location}'"),
    )
    .await;
    assert_eq!(rows[0].get("status").unwrap(), "confirmed");
}

#[tokio::test]
async fn bookings_cannot_be_deleted() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = setup_always_open_location(&client).await;
    let (_, start) = far_start_ms(5);
    let booking = insert_booking(&client, location, start, ITEMS).await.unwrap();

    let err = client
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("cancelled, not deleted"));
}

#[tokio::test]
async fn available_dates_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = setup_always_open_location(&client).await;

    let start_date = (Utc::now().date_naive() + Days::new(1)).to_string();
    let rows = query_rows(
        &client,
        &format!(
            "SELECT * FROM available_dates WHERE location_id = '{location}' \
             AND duration = 60 AND start_date = '{start_date}' AND days = 5"
        ),
    )
    .await;
    assert_eq!(rows.len(), 5);
    assert!(rows
        .iter()
        .all(|r| matches!(r.get("available").unwrap(), "t" | "true")));
    assert_eq!(rows[0].get("date").unwrap(), start_date);
}

#[tokio::test]
async fn listen_channel_validation() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let location = Ulid::new();

    client
        .simple_query(&format!("LISTEN location_{location}"))
        .await
        .unwrap();

    let err = client
        .simple_query("LISTEN kennel_events")
        .await
        .unwrap_err();
    assert!(db_message(err).contains("invalid channel"));
}

#[tokio::test]
async fn tenants_do_not_share_locations() {
    let addr = start_test_server().await;
    let client_a = connect(addr).await;
    let client_b = connect(addr).await;

    let location = setup_always_open_location(&client_a).await;

    // Tenant B sees no such location: its slot queries come back empty.
    let (date, _) = far_start_ms(2);
    assert!(slot_starts(&client_b, location, &date).await.is_empty());
}

#[tokio::test]
async fn weekday_convention_matches_chrono() {
    // The SQL surface expresses weekdays as 0 = Sunday; the dates used
    // in these tests rely on that convention.
    let sunday = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    assert_eq!(sunday.weekday().num_days_from_sunday(), 0);
    let monday = chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    assert_eq!(monday.weekday().num_days_from_sunday(), 1);
}
