/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

mod client;
mod server;

pub use client::{AuthErrorHandler, ClientContext, TcpClient};
pub use server::{Connection, ServerContext, TcpServer};
