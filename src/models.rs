//! Records cached by the point-of-sale client.
//!
//! Only the fields the cache and its diagnostics need are typed; everything
//! else a row carries is kept in `extra` so nothing is lost on the round trip
//! through the durable store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::Cacheable;

macro_rules! cacheable {
  ($ty:ty, $collection:literal) => {
    impl Cacheable for $ty {
      fn cache_key(&self) -> String {
        self.id.clone()
      }

      fn collection() -> &'static str {
        $collection
      }
    }
  };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub sku: Option<String>,
  #[serde(default)]
  pub branch_id: Option<String>,
  #[serde(default)]
  pub category_id: Option<String>,
  #[serde(default = "default_true")]
  pub is_active: bool,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
  pub id: String,
  #[serde(default)]
  pub product_id: Option<String>,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub sku: Option<String>,
  #[serde(default)]
  pub quantity: i64,
  #[serde(default)]
  pub branch_id: Option<String>,
  #[serde(default)]
  pub is_parent: bool,
  #[serde(default)]
  pub variant_type: Option<String>,
  #[serde(default)]
  pub parent_variant_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub branch_id: Option<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
  pub id: String,
  #[serde(default)]
  pub first_name: Option<String>,
  #[serde(default)]
  pub last_name: Option<String>,
  #[serde(default)]
  pub position: Option<String>,
  #[serde(default)]
  pub branch_id: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub account_type: Option<String>,
  #[serde(default = "default_true")]
  pub is_active: bool,
  #[serde(default)]
  pub currency: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
  pub id: String,
  pub employee_id: String,
  pub attendance_date: NaiveDate,
  #[serde(default)]
  pub check_in_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub check_out_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub branch_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub parent_id: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default = "default_true")]
  pub is_active: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub city: Option<String>,
  #[serde(default = "default_true")]
  pub is_active: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn default_true() -> bool {
  true
}

cacheable!(Product, "products");
cacheable!(ProductVariant, "product_variants");
cacheable!(Customer, "customers");
cacheable!(Employee, "employees");
cacheable!(PaymentMethod, "payment_methods");
cacheable!(AttendanceRecord, "attendance");
cacheable!(Category, "categories");
cacheable!(Supplier, "suppliers");
cacheable!(Branch, "branches");
