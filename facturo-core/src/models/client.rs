use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, Result};

/// Client model representing a customer of the freelancer.
///
/// Prestations and invoices reference a client by id. Deletion is only
/// allowed while nothing references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Unique identifier for the client
    pub id: Uuid,

    /// Company or person name
    pub name: String,

    /// Billing email address
    pub email: Option<String>,

    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,

    /// Timestamp when the client was created
    pub created_at: DateTime<Utc>,
}

/// Client creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClient {
    pub name: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl CreateClient {
    /// Validates the request and builds the client record.
    pub fn into_client(self, id: Uuid, now: DateTime<Utc>) -> Result<Client> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(BillingError::validation("name", "client name is required"));
        }
        if let Some(email) = self.email.as_deref() {
            if !email.contains('@') {
                return Err(BillingError::validation("email", "malformed email address"));
            }
        }

        Ok(Client {
            id,
            name,
            email: self.email,
            address: self.address,
            postal_code: self.postal_code,
            city: self.city,
            country: self.country,
            created_at: now,
        })
    }
}
