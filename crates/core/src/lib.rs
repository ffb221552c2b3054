//! `kardex-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by every other crate:
//! strongly-typed identifiers, composite ERP keys and the domain error model.

pub mod entity;
pub mod error;
pub mod id;
pub mod keys;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, ProductId, TransferId, WarehouseId};
pub use keys::{DetailKey, DocType, HeaderKey, ProductCode, WarehouseCode};
pub use value_object::ValueObject;
