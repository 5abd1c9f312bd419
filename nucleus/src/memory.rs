/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Address-space management: the generic page-table cursor, the RCU engine,
//! and the PageSpace/ASID-slot shootdown protocol (spec §4.1).

pub mod page_space;
pub mod page_table;
pub mod rcu;
