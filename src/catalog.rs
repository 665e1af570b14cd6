//! Typed collection fetchers routed through the smart cache.

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;

use crate::cache::{CacheKey, Cacheable, FetchOptions, SmartCache};
use crate::error::FetchError;
use crate::models::{
  AttendanceRecord, Branch, Category, Customer, Employee, PaymentMethod, Product, ProductVariant,
  Supplier,
};
use crate::source::{fetcher, CollectionRequest, CollectionSource};

/// Collection holding IMEI child variants, partitioned by parent variant id.
pub const CHILD_VARIANTS: &str = "variant_children";

/// The named collections the point-of-sale client caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Collection {
  Products,
  /// Parent product variants
  Variants,
  Customers,
  Employees,
  PaymentMethods,
  Attendance,
  Categories,
  Suppliers,
  Branches,
}

impl Collection {
  /// Warmed after login and on branch switch.
  pub const PRELOADED: [Collection; 7] = [
    Collection::Products,
    Collection::Variants,
    Collection::Customers,
    Collection::PaymentMethods,
    Collection::Categories,
    Collection::Suppliers,
    Collection::Branches,
  ];

  /// Cache collection name; matches [`Cacheable::collection`] of the row type.
  pub fn name(self) -> &'static str {
    match self {
      Collection::Products => Product::collection(),
      Collection::Variants => ProductVariant::collection(),
      Collection::Customers => Customer::collection(),
      Collection::Employees => Employee::collection(),
      Collection::PaymentMethods => PaymentMethod::collection(),
      Collection::Attendance => AttendanceRecord::collection(),
      Collection::Categories => Category::collection(),
      Collection::Suppliers => Supplier::collection(),
      Collection::Branches => Branch::collection(),
    }
  }

  /// Remote table the rows come from.
  pub fn table(self) -> &'static str {
    match self {
      Collection::Products => "lats_products",
      Collection::Variants => "lats_product_variants",
      Collection::Customers => "customers",
      Collection::Employees => "employees",
      Collection::PaymentMethods => "finance_accounts",
      Collection::Attendance => "attendance_records",
      Collection::Categories => "lats_categories",
      Collection::Suppliers => "lats_suppliers",
      Collection::Branches => "store_locations",
    }
  }

  /// Whether the key carries the branch id.
  pub fn branch_scoped(self) -> bool {
    matches!(
      self,
      Collection::Products
        | Collection::Variants
        | Collection::Customers
        | Collection::Employees
        | Collection::Attendance
    )
  }

  fn branch(self, branch: Option<&str>) -> Option<&str> {
    branch.filter(|_| self.branch_scoped())
  }

  pub fn key(self, branch: Option<&str>) -> CacheKey {
    CacheKey::scoped(self.name(), self.branch(branch))
  }

  pub fn request(self, branch: Option<&str>) -> CollectionRequest {
    let request = CollectionRequest::new(self.table()).in_branch(self.branch(branch));
    match self {
      Collection::Variants => request.is_null("parent_variant_id"),
      Collection::PaymentMethods => request.eq("is_payment_method", "true"),
      Collection::Attendance => request.order_by("attendance_date", true),
      Collection::Products | Collection::Categories | Collection::Suppliers => {
        request.order_by("name", false)
      }
      _ => request,
    }
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

pub fn child_variants_key(parent_id: &str) -> CacheKey {
  CacheKey::partitioned(CHILD_VARIANTS, parent_id)
}

pub fn child_variants_request(parent_id: &str) -> CollectionRequest {
  CollectionRequest::new(Collection::Variants.table())
    .eq("parent_variant_id", parent_id)
    .eq("variant_type", "imei_child")
}

/// Collection fetchers with transparent caching.
///
/// Wraps a [`CollectionSource`] and routes every read through the
/// [`SmartCache`], so repeat reads are served from memory or disk.
#[derive(Clone)]
pub struct Catalog<S> {
  source: S,
  cache: SmartCache,
}

impl<S: CollectionSource> Catalog<S> {
  pub fn new(source: S, cache: SmartCache) -> Self {
    Self { source, cache }
  }

  pub fn cache(&self) -> &SmartCache {
    &self.cache
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Read `collection` for `branch` as rows of `T`.
  pub async fn load<T: Cacheable>(
    &self,
    collection: Collection,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<T>>, FetchError> {
    self
      .cache
      .smart_fetch(
        collection.key(branch),
        fetcher::<S, T>(self.source.clone(), collection.request(branch)),
        options,
      )
      .await
  }

  pub async fn products(
    &self,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<Product>>, FetchError> {
    self.load(Collection::Products, branch, options).await
  }

  pub async fn parent_variants(
    &self,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<ProductVariant>>, FetchError> {
    self.load(Collection::Variants, branch, options).await
  }

  /// IMEI children of one parent variant.
  pub async fn child_variants(
    &self,
    parent_id: &str,
    options: FetchOptions,
  ) -> Result<Arc<Vec<ProductVariant>>, FetchError> {
    self
      .cache
      .smart_fetch(
        child_variants_key(parent_id),
        fetcher::<S, ProductVariant>(self.source.clone(), child_variants_request(parent_id)),
        options,
      )
      .await
  }

  pub async fn customers(
    &self,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<Customer>>, FetchError> {
    self.load(Collection::Customers, branch, options).await
  }

  pub async fn employees(
    &self,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<Employee>>, FetchError> {
    self.load(Collection::Employees, branch, options).await
  }

  pub async fn payment_methods(
    &self,
    options: FetchOptions,
  ) -> Result<Arc<Vec<PaymentMethod>>, FetchError> {
    self.load(Collection::PaymentMethods, None, options).await
  }

  pub async fn attendance(
    &self,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<Arc<Vec<AttendanceRecord>>, FetchError> {
    self.load(Collection::Attendance, branch, options).await
  }

  pub async fn categories(&self, options: FetchOptions) -> Result<Arc<Vec<Category>>, FetchError> {
    self.load(Collection::Categories, None, options).await
  }

  pub async fn suppliers(&self, options: FetchOptions) -> Result<Arc<Vec<Supplier>>, FetchError> {
    self.load(Collection::Suppliers, None, options).await
  }

  pub async fn branches(&self, options: FetchOptions) -> Result<Arc<Vec<Branch>>, FetchError> {
    self.load(Collection::Branches, None, options).await
  }

  /// Read any collection and report how many rows it holds.
  pub async fn refresh(
    &self,
    collection: Collection,
    branch: Option<&str>,
    options: FetchOptions,
  ) -> Result<usize, FetchError> {
    let count = match collection {
      Collection::Products => self.products(branch, options).await?.len(),
      Collection::Variants => self.parent_variants(branch, options).await?.len(),
      Collection::Customers => self.customers(branch, options).await?.len(),
      Collection::Employees => self.employees(branch, options).await?.len(),
      Collection::PaymentMethods => self.payment_methods(options).await?.len(),
      Collection::Attendance => self.attendance(branch, options).await?.len(),
      Collection::Categories => self.categories(options).await?.len(),
      Collection::Suppliers => self.suppliers(options).await?.len(),
      Collection::Branches => self.branches(options).await?.len(),
    };
    Ok(count)
  }
}
