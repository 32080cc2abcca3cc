pub mod account;
pub mod client;
pub mod invoice;
pub mod period;
pub mod prestation;

pub use account::AccountContext;
pub use client::{Client, CreateClient};
pub use invoice::{Avoir, Invoice, InvoiceDocument, InvoiceStatus, RectificationInfo};
pub use period::Period;
pub use prestation::{Billing, BillingInput, DurationUnit, Prestation, PrestationDraft};
