//! # mssql-bridge-types
//!
//! Plain data containers exchanged between a transport and the callers of
//! the bridge.
//!
//! The transport decodes the wire format into [`SqlValue`]s and groups them
//! into a [`ResultSet`]. Everything above the transport treats those values
//! as opaque and passes them through unchanged.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | Variant |
//! |-----------------|---------|
//! | `BIT` | [`SqlValue::Bool`] |
//! | `TINYINT` / `SMALLINT` / `INT` / `BIGINT` | `TinyInt` / `SmallInt` / `Int` / `BigInt` |
//! | `REAL` / `FLOAT` | `Float` / `Double` |
//! | `DECIMAL` / `NUMERIC` / `MONEY` | `Decimal` |
//! | `CHAR` / `VARCHAR` / `NCHAR` / `NVARCHAR` | `String` |
//! | `BINARY` / `VARBINARY` | `Binary` |
//! | `UNIQUEIDENTIFIER` | `Uuid` |
//! | `DATE` / `TIME` / `DATETIME2` / `DATETIMEOFFSET` | `Date` / `Time` / `DateTime` / `DateTimeOffset` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod from_sql;
pub mod row;
pub mod value;

pub use error::TypeError;
pub use from_sql::FromSql;
pub use row::{Column, ColumnIndex, ResultSet, Row};
pub use value::SqlValue;
