pub mod avoir;
pub mod operations;
pub mod rectification;
pub mod state_machine;

pub use avoir::{AvoirPlan, AvoirRequest};
pub use operations::PaymentRequest;
pub use rectification::{
    rectification_chain, LineRef, RectificationOutcome, RectificationPlan, RectificationRequest,
    ReplacementLine,
};
pub use state_machine::{InvoiceEvent, InvoiceStateMachine, SideEffect, Target, Transition};
