use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Flash Sale API",
        version = "1.0.0",
        description = "Flash sale backend: a fixed quota of items per recurring sale window, \
            a per-user purchase cap, and atomic code redemption.",
        license(name = "MIT")
    ),
    tags(
        (name = "sale", description = "Checkout, purchase and sale statistics"),
        (name = "health", description = "Health check endpoints")
    ),
    paths(
        crate::routes::checkout::checkout,
        crate::routes::purchase::purchase,
        crate::routes::stats::stats,
        crate::routes::health::health,
    ),
    components(schemas(
        crate::routes::checkout::CheckoutResponse,
        crate::routes::purchase::PurchaseResponse,
        crate::routes::stats::StatsResponse,
        crate::routes::health::HealthResponse,
        crate::error::ErrorBody,
    ))
)]
pub struct ApiDoc;
