pub mod backend;
pub mod gateway;
pub mod route_resolver;
pub mod tenant_router;

pub use gateway::{GatewayService, SelectedBackend, TenantRuntime};
pub use tenant_router::TenantRouter;
