use crate::db::alerts::AlertType;
use crate::db::credentials::Environment;
use crate::db::invoice_events::EventType;
use crate::db::invoices::InvoiceStatus;
use crate::db::merchants::MerchantStatus;
use crate::db::webhook_deliveries::DeliveryStatus;
use diesel::backend;
use diesel::deserialize;
use diesel::deserialize::FromSql;
use diesel::serialize;
use diesel::serialize::IsNull;
use diesel::serialize::Output;
use diesel::serialize::ToSql;
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;

impl ToSql<Text, Sqlite> for MerchantStatus {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        let text = match *self {
            MerchantStatus::Unverified => "unverified".to_string(),
            MerchantStatus::Submitted => "submitted".to_string(),
            MerchantStatus::Active => "active".to_string(),
            MerchantStatus::Rejected => "rejected".to_string(),
            MerchantStatus::Suspended => "suspended".to_string(),
        };
        out.set_value(text);
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for MerchantStatus {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "unverified" => Ok(MerchantStatus::Unverified),
            "submitted" => Ok(MerchantStatus::Submitted),
            "active" => Ok(MerchantStatus::Active),
            "rejected" => Ok(MerchantStatus::Rejected),
            "suspended" => Ok(MerchantStatus::Suspended),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl ToSql<Text, Sqlite> for Environment {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        out.set_value(self.as_str().to_string());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for Environment {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "production" => Ok(Environment::Production),
            "sandbox" => Ok(Environment::Sandbox),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl ToSql<Text, Sqlite> for InvoiceStatus {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        let text = match *self {
            InvoiceStatus::Created => "created".to_string(),
            InvoiceStatus::Pending => "pending".to_string(),
            InvoiceStatus::Paid => "paid".to_string(),
            InvoiceStatus::Expired => "expired".to_string(),
            InvoiceStatus::Refunded => "refunded".to_string(),
        };
        out.set_value(text);
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for InvoiceStatus {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "created" => Ok(InvoiceStatus::Created),
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "expired" => Ok(InvoiceStatus::Expired),
            "refunded" => Ok(InvoiceStatus::Refunded),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl ToSql<Text, Sqlite> for EventType {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        out.set_value(self.as_str().to_string());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for EventType {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "payment.created" => Ok(EventType::PaymentCreated),
            "payment.paid" => Ok(EventType::PaymentPaid),
            "payment.expired" => Ok(EventType::PaymentExpired),
            "refund.requested" => Ok(EventType::RefundRequested),
            "refund.processed" => Ok(EventType::RefundProcessed),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl ToSql<Text, Sqlite> for DeliveryStatus {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        let text = match *self {
            DeliveryStatus::Queued => "queued".to_string(),
            DeliveryStatus::Delivered => "delivered".to_string(),
            DeliveryStatus::Failed => "failed".to_string(),
        };
        out.set_value(text);
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for DeliveryStatus {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "queued" => Ok(DeliveryStatus::Queued),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl ToSql<Text, Sqlite> for AlertType {
    fn to_sql(&self, out: &mut Output<Sqlite>) -> serialize::Result {
        let text = match *self {
            AlertType::WebhookFailed => "webhook.failed".to_string(),
        };
        out.set_value(text);
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for AlertType {
    fn from_sql(bytes: backend::RawValue<Sqlite>) -> deserialize::Result<Self> {
        let string = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;

        match string.as_str() {
            "webhook.failed" => Ok(AlertType::WebhookFailed),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}
