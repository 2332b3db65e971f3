// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Hackage repository interaction.

This crate facilitates securely fetching package metadata and package
tarballs from Hackage-style repositories, whose integrity is protected
by a chain of signed role documents in the style of The Update
Framework: a *root* document delegates keys to the *timestamp*,
*snapshot*, *targets* and *mirrors* roles, and every downloaded file is
verified against the lengths, digests and signatures those documents
record before it is trusted.

Trust is established once via [client::Client::bootstrap] from
out-of-band root key fingerprints. After that,
[client::Client::check_for_updates] keeps a local cache — including the
package index, a tar archive served with random access through an
offset table — synchronized with the repository, and
[client::Client::download_package] retrieves verified package tarballs.

Repositories are accessed through the [repository::Repository] trait.
[repository::http::RemoteRepository] reads mirrors over HTTP;
[repository::local::LocalRepository] reads a repository laid out on the
local filesystem. Both run every fetched byte through the same
verification pipeline.
*/

pub mod cache;
pub mod cjson;
pub mod client;
pub mod crypto;
pub mod error;
pub mod index;
pub mod io;
pub mod metadata;
pub mod repository;

pub use crate::{
    cache::Cache,
    client::{Client, PackageId, UpdateOutcome},
    error::{HackageRepositoryError, Result},
    repository::{LocalRepository, RemoteRepository, Repository},
};
