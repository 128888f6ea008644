/// State management module
///
/// This module handles all persisted state:
/// - Database connection and queries (library.rs)
/// - Shared data structures (data.rs)

pub mod data;
pub mod library;

pub use data::{
    AstrometryStatus, CatalogEntry, CatalogType, Image, ImageCatalogMatch, NewImage, NewMatch,
    StatusTransition,
};
pub use library::{Library, LibraryError};
