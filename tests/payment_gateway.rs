use httpmock::prelude::*;
use metered_gateway::billing::{
    CheckoutMode, CheckoutRequest, GatewayError, PaymentGateway, StripeAdapter,
};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn checkout_session_is_form_posted_with_account_metadata() {
    let server = MockServer::start_async().await;
    let account_id = Uuid::new_v4();

    let create_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/checkout/sessions")
            .header("authorization", "Bearer sk_test_123")
            .x_www_form_urlencoded_tuple("mode", "payment")
            .x_www_form_urlencoded_tuple("metadata[userId]", &account_id.to_string())
            .x_www_form_urlencoded_tuple("line_items[0][price]", "price_small")
            .x_www_form_urlencoded_tuple("customer_email", "buyer@example.com")
            .x_www_form_urlencoded_tuple(
                "success_url",
                "https://app.example/chat?session_id={CHECKOUT_SESSION_ID}",
            )
            .x_www_form_urlencoded_tuple("cancel_url", "https://app.example/pricing");
        then.status(200).json_body(json!({
            "id": "cs_test_1",
            "url": "https://checkout.stripe.test/pay/cs_test_1"
        }));
    });

    let adapter =
        StripeAdapter::new(server.base_url(), "sk_test_123", "https://app.example/").unwrap();
    let session = adapter
        .create_checkout_session(&CheckoutRequest {
            account_id,
            email: Some("buyer@example.com".to_string()),
            price_id: "price_small".to_string(),
            mode: CheckoutMode::Payment,
        })
        .await
        .unwrap();

    create_mock.assert();
    assert_eq!(session.id, "cs_test_1");
    assert_eq!(
        session.url.as_deref(),
        Some("https://checkout.stripe.test/pay/cs_test_1")
    );
}

#[tokio::test]
async fn gateway_errors_carry_status_and_body() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/checkout/sessions");
        then.status(402)
            .json_body(json!({ "error": { "message": "card declined" } }));
    });

    let adapter = StripeAdapter::new(server.base_url(), "sk_test_123", "https://app.example").unwrap();
    let request = CheckoutRequest {
        account_id: Uuid::new_v4(),
        email: None,
        price_id: "price_unlimited".to_string(),
        mode: CheckoutMode::Subscription,
    };
    let err = adapter.create_checkout_session(&request).await.unwrap_err();
    match err {
        GatewayError::Status { status, body } => {
            assert_eq!(status, 402);
            assert!(body.contains("card declined"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn session_without_url_is_rejected() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/checkout/sessions");
        then.status(200)
            .json_body(json!({ "id": "cs_no_url", "url": null }));
    });

    let adapter = StripeAdapter::new(server.base_url(), "sk_test_123", "https://app.example").unwrap();
    let err = adapter
        .create_checkout_session(&CheckoutRequest {
            account_id: Uuid::new_v4(),
            email: None,
            price_id: "price_small".to_string(),
            mode: CheckoutMode::Payment,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::MissingField("url")));
}

#[tokio::test]
async fn line_items_resolve_the_purchased_price() {
    let server = MockServer::start_async().await;
    let items_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/checkout/sessions/cs_paid/line_items")
            .query_param("limit", "1");
        then.status(200).json_body(json!({
            "object": "list",
            "data": [{ "id": "li_1", "price": { "id": "price_large" } }]
        }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/v1/checkout/sessions/cs_empty/line_items");
        then.status(200).json_body(json!({ "object": "list", "data": [] }));
    });

    let adapter = StripeAdapter::new(server.base_url(), "sk_test_123", "https://app.example").unwrap();
    assert_eq!(
        adapter.checkout_price_id("cs_paid").await.unwrap().as_deref(),
        Some("price_large")
    );
    assert_eq!(adapter.checkout_price_id("cs_empty").await.unwrap(), None);
    items_mock.assert();
}

#[tokio::test]
async fn subscription_is_fetched_with_its_billing_period() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET)
            .path("/v1/subscriptions/sub_42")
            .header("authorization", "Bearer sk_test_123");
        then.status(200).json_body(json!({
            "id": "sub_42",
            "object": "subscription",
            "status": "active",
            "customer": "cus_42",
            "cancel_at_period_end": false,
            "items": { "data": [
                { "current_period_start": 1_760_000_000, "current_period_end": 1_762_592_000 }
            ]}
        }));
    });

    let adapter = StripeAdapter::new(server.base_url(), "sk_test_123", "https://app.example").unwrap();
    let subscription = adapter.subscription("sub_42").await.unwrap();
    assert_eq!(subscription.id, "sub_42");
    assert_eq!(subscription.status, "active");
    let period = subscription.period().unwrap();
    assert_eq!(period.start.timestamp(), 1_760_000_000);
    assert_eq!(period.end.timestamp(), 1_762_592_000);
}
