use anyhow::Result;
use orderbus::webhook::NotificationError;
use orderbus::{NotificationIngestor, NotificationResponse};

const VALIDATION_BATCH: &str = r#"[{
    "id": "2d1781af-3a4c-4d7c-bd0c-e34b19da4e66",
    "topic": "/subscriptions/xxxxxxxx/resourceGroups/orders/providers/Microsoft.EventGrid/topics/order-events",
    "subject": "",
    "data": {
        "validationCode": "512d38b6-c7b8-40c8-89fe-f46f9e9622b6",
        "validationUrl": "https://rp-eastus2.eventgrid.azure.net:553/eventsubscriptions/orders/validate?code=512d38b6"
    },
    "eventType": "Microsoft.EventGrid.SubscriptionValidationEvent",
    "eventTime": "2024-05-01T18:41:00.9584103Z",
    "metadataVersion": "1",
    "dataVersion": "2"
}]"#;

const ORDER_BATCH: &str = r#"[
    {
        "id": "evt-100",
        "eventType": "OrderCreated",
        "subject": "orders/ORD-100",
        "eventTime": "2024-05-01T18:42:00Z",
        "data": {"OrderId": "ORD-100", "CustomerName": "Ada Lovelace", "TotalAmount": 42.50},
        "dataVersion": "1.0"
    },
    {
        "id": "evt-101",
        "eventType": "OrderStatusUpdate",
        "subject": "orders/ORD-100",
        "data": {"OrderId": "ORD-100", "Status": "Shipped"}
    },
    {
        "id": "evt-102",
        "eventType": "InventoryAdjusted",
        "subject": "inventory/SKU-9"
    }
]"#;

#[test]
fn handshake_echoes_validation_code() -> Result<()> {
    let ingestor = NotificationIngestor::default();

    let response = ingestor.ingest(VALIDATION_BATCH.as_bytes())?;

    assert_eq!(
        serde_json::to_value(&response)?,
        serde_json::json!({"validationResponse": "512d38b6-c7b8-40c8-89fe-f46f9e9622b6"})
    );
    Ok(())
}

#[test]
fn order_events_are_acknowledged_once_and_redeliveries_tolerated() -> Result<()> {
    let ingestor = NotificationIngestor::default();

    assert_eq!(
        ingestor.ingest(ORDER_BATCH.as_bytes())?,
        NotificationResponse::Acknowledged {
            accepted: 3,
            duplicates: 0
        }
    );
    assert_eq!(
        ingestor.ingest(ORDER_BATCH.as_bytes())?,
        NotificationResponse::Acknowledged {
            accepted: 0,
            duplicates: 3
        }
    );
    Ok(())
}

#[test]
fn empty_batch_is_rejected() {
    let ingestor = NotificationIngestor::default();
    let err = ingestor.ingest(b"[]").unwrap_err();
    assert!(matches!(err, NotificationError::EmptyBatch));
    assert_eq!(err.to_string(), "no events received");
}
