//! Companies, warehouses and products.

use serde::{Deserialize, Serialize};

use kardex_core::{CompanyId, Entity, ProductCode, ProductId, WarehouseCode, WarehouseId};

/// A company: tenant boundary and selector of one ERP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    /// Logical name; also the key of the ERP connection registry.
    pub alias: String,
    pub name: String,
}

impl Company {
    pub fn new(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: CompanyId::new(),
            alias: alias.into().trim().to_string(),
            name: name.into(),
        }
    }
}

impl Entity for Company {
    type Id = CompanyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A physical location. Unique on `(company_id, code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub company_id: CompanyId,
    pub code: WarehouseCode,
    pub description: String,
}

impl Warehouse {
    pub fn new(company_id: CompanyId, code: WarehouseCode, description: impl Into<String>) -> Self {
        Self {
            id: WarehouseId::new(),
            company_id,
            code,
            description: description.into(),
        }
    }
}

impl Entity for Warehouse {
    type Id = WarehouseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A catalog item. Unique on `(company_id, code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub company_id: CompanyId,
    pub code: ProductCode,
    pub name: String,
}

impl Product {
    pub fn new(company_id: CompanyId, code: ProductCode, name: impl Into<String>) -> Self {
        Self {
            id: ProductId::new(),
            company_id,
            code,
            name: name.into(),
        }
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
