//! Domain models for the lending/collections records
//!
//! Each table has a typed record. The generic [`FieldMap`] only appears at the
//! delta boundary, where records travel as field deltas or CRDT snapshots.

use crate::error::{Result, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field name to JSON value, ordered by field name.
pub type FieldMap = BTreeMap<String, Value>;

/// Per-device logical counters.
pub type VersionVector = BTreeMap<String, u64>;

/// Priority assigned to tables the engine does not know about.
pub const UNKNOWN_TABLE_PRIORITY: u8 = 4;

// =============================================================================
// Tables
// =============================================================================

/// How concurrent writes to a table are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Rows are immutable facts once written
    AppendOnly,
    /// Rows are edited in place and merged field by field
    Editable,
}

/// The closed set of synchronized tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Clientes,
    Creditos,
    Cuotas,
    Pagos,
}

impl TableKind {
    /// All tables, in upload priority order.
    pub const ALL: [TableKind; 4] = [
        TableKind::Pagos,
        TableKind::Creditos,
        TableKind::Cuotas,
        TableKind::Clientes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Clientes => "clientes",
            TableKind::Creditos => "creditos",
            TableKind::Cuotas => "cuotas",
            TableKind::Pagos => "pagos",
        }
    }

    /// Resolve a table name, accepting the English aliases used by older clients.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "clientes" | "clients" | "customers" => Some(TableKind::Clientes),
            "creditos" | "credits" | "loans" => Some(TableKind::Creditos),
            "cuotas" | "installments" => Some(TableKind::Cuotas),
            "pagos" | "payments" => Some(TableKind::Pagos),
            _ => None,
        }
    }

    /// Upload priority: payments first, then credit data, then clients.
    pub fn upload_priority(&self) -> u8 {
        match self {
            TableKind::Pagos => 1,
            TableKind::Creditos | TableKind::Cuotas => 2,
            TableKind::Clientes => 3,
        }
    }

    pub fn conflict_kind(&self) -> ConflictKind {
        match self {
            TableKind::Pagos => ConflictKind::AppendOnly,
            _ => ConflictKind::Editable,
        }
    }
}

/// Upload priority for a raw table name, `4` when unknown.
pub fn upload_priority(table_name: &str) -> u8 {
    TableKind::parse(table_name)
        .map(|kind| kind.upload_priority())
        .unwrap_or(UNKNOWN_TABLE_PRIORITY)
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        TableKind::parse(s).ok_or_else(|| StoreError::UnknownTable(s.to_string()))
    }
}

// =============================================================================
// Typed Records
// =============================================================================

/// Borrower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cliente {
    pub id: String,
    pub nombre: String,
    pub documento: String,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstadoCredito {
    Activo,
    Pagado,
    Vencido,
    Castigado,
}

/// Loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credito {
    pub id: String,
    pub cliente_id: String,
    pub monto: f64,
    pub tasa_interes: f64,
    pub numero_cuotas: u32,
    pub fecha_desembolso: NaiveDate,
    pub estado: EstadoCredito,
}

/// Installment of a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cuota {
    pub id: String,
    pub credito_id: String,
    pub numero: u32,
    pub monto: f64,
    pub fecha_vencimiento: NaiveDate,
    #[serde(default)]
    pub pagada: bool,
}

/// Payment; immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pago {
    pub id: String,
    pub credito_id: String,
    pub cuota_id: Option<String>,
    pub monto: f64,
    pub fecha_pago: NaiveDate,
    pub metodo: Option<String>,
}

/// A domain record of one of the synchronized tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "lowercase")]
pub enum Record {
    Cliente(Cliente),
    Credito(Credito),
    Cuota(Cuota),
    Pago(Pago),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Cliente(r) => &r.id,
            Record::Credito(r) => &r.id,
            Record::Cuota(r) => &r.id,
            Record::Pago(r) => &r.id,
        }
    }

    pub fn table(&self) -> TableKind {
        match self {
            Record::Cliente(_) => TableKind::Clientes,
            Record::Credito(_) => TableKind::Creditos,
            Record::Cuota(_) => TableKind::Cuotas,
            Record::Pago(_) => TableKind::Pagos,
        }
    }

    /// Validate required fields and basic amounts
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id().trim().is_empty() {
            return Err("Record id cannot be empty".to_string());
        }

        match self {
            Record::Cliente(c) => {
                if c.nombre.trim().is_empty() {
                    return Err("Cliente nombre cannot be empty".to_string());
                }
                if c.documento.trim().is_empty() {
                    return Err("Cliente documento cannot be empty".to_string());
                }
            }
            Record::Credito(c) => {
                if c.cliente_id.trim().is_empty() {
                    return Err("Credito cliente_id cannot be empty".to_string());
                }
                if !is_positive(c.monto) {
                    return Err("Credito monto must be positive".to_string());
                }
                if c.tasa_interes < 0.0 {
                    return Err("Credito tasa_interes cannot be negative".to_string());
                }
                if c.numero_cuotas == 0 {
                    return Err("Credito numero_cuotas must be at least 1".to_string());
                }
            }
            Record::Cuota(c) => {
                if c.credito_id.trim().is_empty() {
                    return Err("Cuota credito_id cannot be empty".to_string());
                }
                if c.numero == 0 {
                    return Err("Cuota numero starts at 1".to_string());
                }
                if !is_positive(c.monto) {
                    return Err("Cuota monto must be positive".to_string());
                }
            }
            Record::Pago(p) => {
                if p.credito_id.trim().is_empty() {
                    return Err("Pago credito_id cannot be empty".to_string());
                }
                if !is_positive(p.monto) {
                    return Err("Pago monto must be positive".to_string());
                }
            }
        }

        Ok(())
    }

    /// Flatten into a field map (the `id` is included).
    pub fn to_fields(&self) -> Result<FieldMap> {
        let value = match self {
            Record::Cliente(r) => serde_json::to_value(r)?,
            Record::Credito(r) => serde_json::to_value(r)?,
            Record::Cuota(r) => serde_json::to_value(r)?,
            Record::Pago(r) => serde_json::to_value(r)?,
        };

        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(StoreError::InvalidInput {
                field: "record".to_string(),
                message: format!("expected an object, got {}", other),
            }),
        }
    }

    /// Rebuild a typed record from a field map.
    pub fn from_fields(table: TableKind, fields: &FieldMap) -> Result<Self> {
        let value = Value::Object(fields.clone().into_iter().collect());
        let record = match table {
            TableKind::Clientes => Record::Cliente(serde_json::from_value(value)?),
            TableKind::Creditos => Record::Credito(serde_json::from_value(value)?),
            TableKind::Cuotas => Record::Cuota(serde_json::from_value(value)?),
            TableKind::Pagos => Record::Pago(serde_json::from_value(value)?),
        };
        Ok(record)
    }
}

fn is_positive(amount: f64) -> bool {
    amount.is_finite() && amount > 0.0
}

// =============================================================================
// CRDT Metadata
// =============================================================================

/// The last write of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVersion {
    pub value: Value,
    pub timestamp: i64,
    pub device_id: String,
}

/// A record together with the metadata needed to merge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtRecord {
    pub id: String,
    pub tenant_id: Option<String>,
    /// Domain fields, `id` excluded
    pub fields: FieldMap,
    pub version_vector: VersionVector,
    pub field_versions: BTreeMap<String, FieldVersion>,
    pub synced: bool,
    /// Unix millis of the last local or merged write
    pub updated_at: i64,
}

impl CrdtRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: None,
            fields: FieldMap::new(),
            version_vector: VersionVector::new(),
            field_versions: BTreeMap::new(),
            synced: false,
            updated_at: 0,
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_fields(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self.fields.remove("id");
        self
    }

    /// Wrap a typed record without any version history.
    pub fn from_record(record: &Record) -> Result<Self> {
        record.validate().map_err(|message| StoreError::InvalidInput {
            field: record.table().to_string(),
            message,
        })?;

        Ok(Self::new(record.id()).with_fields(record.to_fields()?))
    }

    /// Decode the domain fields into the typed record for `table`.
    pub fn to_record(&self, table: TableKind) -> Result<Record> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Record::from_fields(table, &fields)
    }

    /// Largest device id present in the version vector.
    pub fn max_device_id(&self) -> Option<&str> {
        self.version_vector.keys().next_back().map(String::as_str)
    }

    /// Check the structural invariants of the metadata
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Record id cannot be empty".to_string());
        }

        if let Some(field) = self
            .field_versions
            .keys()
            .find(|field| !self.fields.contains_key(*field))
        {
            return Err(format!("Field version for unknown field '{}'", field));
        }

        Ok(())
    }
}
