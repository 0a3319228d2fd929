pub mod api;
pub mod models;
pub mod period;
pub mod pricing;
pub mod scheduler;
pub mod service;

pub use models::{
    BillingPeriod, BulkGenerationError, BulkGenerationReport, HydratedInvoice, Invoice,
    InvoiceLineItem, InvoiceStatus,
};
pub use period::{compute_period, current_billing_period};
pub use pricing::PricingService;
pub use scheduler::{
    process_invoice_close_tick, process_monthly_tick, process_overdue_tick,
    spawn as spawn_billing_schedulers,
};
pub use service::{InvoiceFilter, InvoiceService};
