// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Drive Organizer: AI-powered image organization for cloud drives
//!
//! Images are listed through a [`storage::StorageProvider`], labelled by an
//! [`recognition::ImageRecognizer`], indexed in the [`tagstore::TagStore`]
//! and copied into category folders by the [`organizer::DriveOrganizer`].

pub mod config;
pub mod error;
pub mod history;
pub mod organizer;
pub mod recognition;
pub mod storage;
pub mod tagstore;
pub mod web;

pub use config::AppConfig;
pub use error::{OrganizerError, Result};
