// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! `DatasourceDriver` (C4) implementations: SQL (`sqlx`, any backend),
//! flatfile (`csv`), and LDAP (`ldap3`).

pub mod flatfile;
pub mod ldap;
pub mod sql;

pub use flatfile::FlatfileDriver;
pub use ldap::LdapDriver;
pub use sql::SqlDriver;
