//! Per-entity queries: thin instantiations of [`CollectionQuery`].

use chrono::{Duration, NaiveDate, Utc};

use super::{CollectionQuery, QueryContext};
use crate::cache::{CacheKey, Cacheable};
use crate::catalog::{child_variants_key, child_variants_request, Collection};
use crate::models::{AttendanceRecord, Customer, Employee, PaymentMethod, Product, ProductVariant};
use crate::source::{fetcher, CollectionRequest, CollectionSource};

/// Narrowing applied to attendance rows after retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendanceFilter {
  pub employee_id: Option<String>,
  /// Only records from the last N days, today included
  pub last_days: Option<u32>,
}

impl AttendanceFilter {
  pub fn employee(employee_id: impl Into<String>) -> Self {
    Self {
      employee_id: Some(employee_id.into()),
      last_days: None,
    }
  }

  pub fn last_days(mut self, days: u32) -> Self {
    self.last_days = Some(days);
    self
  }

  pub fn matches(&self, record: &AttendanceRecord, today: NaiveDate) -> bool {
    if let Some(employee_id) = &self.employee_id {
      if record.employee_id != *employee_id {
        return false;
      }
    }
    match self.last_days {
      Some(days) => {
        let since = today - Duration::days(i64::from(days.saturating_sub(1)));
        record.attendance_date >= since
      }
      None => true,
    }
  }
}

/// Query factory for the cached entities.
#[derive(Clone)]
pub struct Hooks<S> {
  ctx: QueryContext,
  source: S,
}

impl<S: CollectionSource> Hooks<S> {
  pub fn new(ctx: QueryContext, source: S) -> Self {
    Self { ctx, source }
  }

  pub fn context(&self) -> &QueryContext {
    &self.ctx
  }

  fn query<T: Cacheable>(&self, key: CacheKey, request: CollectionRequest) -> CollectionQuery<T> {
    CollectionQuery::new(
      self.ctx.clone(),
      key,
      fetcher::<S, T>(self.source.clone(), request),
    )
  }

  fn collection<T: Cacheable>(
    &self,
    collection: Collection,
    branch: Option<&str>,
  ) -> CollectionQuery<T> {
    self.query(collection.key(branch), collection.request(branch))
  }

  pub fn customers(&self, branch: Option<&str>) -> CollectionQuery<Customer> {
    self.collection(Collection::Customers, branch)
  }

  pub fn employees(&self, branch: Option<&str>) -> CollectionQuery<Employee> {
    self.collection(Collection::Employees, branch)
  }

  pub fn products(&self, branch: Option<&str>) -> CollectionQuery<Product> {
    self.collection(Collection::Products, branch)
  }

  pub fn payment_methods(&self, active_only: bool) -> CollectionQuery<PaymentMethod> {
    let query = self.collection(Collection::PaymentMethods, None);
    if active_only {
      query.with_filter(|method: &PaymentMethod| method.is_active)
    } else {
      query
    }
  }

  pub fn parent_variants(&self, branch: Option<&str>) -> CollectionQuery<ProductVariant> {
    self.collection(Collection::Variants, branch)
  }

  pub fn child_variants(&self, parent_id: &str) -> CollectionQuery<ProductVariant> {
    self.query(child_variants_key(parent_id), child_variants_request(parent_id))
  }

  pub fn attendance(
    &self,
    branch: Option<&str>,
    filter: AttendanceFilter,
  ) -> CollectionQuery<AttendanceRecord> {
    self
      .collection(Collection::Attendance, branch)
      .with_filter(move |record: &AttendanceRecord| {
        filter.matches(record, Utc::now().date_naive())
      })
  }
}
