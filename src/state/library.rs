use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use std::path::{Path, PathBuf};

use super::data::{
    AstrometryStatus, CatalogEntry, CatalogType, Image, ImageCatalogMatch, NewImage, NewMatch,
    StatusTransition,
};
use crate::common::AstroCoord;
use crate::solver::common::{Calibration, WcsHeader};

const IMAGE_COLUMNS: &str = "id, file_path, width, height, status, submission_id, job_id, \
     result_url, failure_reason, ra_center, dec_center, pixel_scale, rotation, parity, \
     field_radius, solution_imported, updated_at, wcs_header";

const CATALOG_COLUMNS: &str =
    "catalog_type, designation, ra, dec, common_name, object_type, magnitude";

const MATCH_COLUMNS: &str = "id, image_id, catalog_type, designation, angular_separation, \
     pixel_x, pixel_y, confidence, matched_at";

/// The Library manages the SQLite catalog database.
/// It stores images with their astrometric state, the static reference
/// catalogs, and the catalog objects matched to each solved image.
///
/// The connection sits behind a mutex so a single library can be shared
/// between tasks; every status change is checked against the status graph
/// while the lock is held.
pub struct Library {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Library {
    /// Open (or create) the database at `path` and initialize the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let db_path = path.as_ref().to_path_buf();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        info!("Database opened at: {}", db_path.display());

        let library = Library {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        library.init_schema()?;
        Ok(library)
    }

    /// A private database that lives as long as the library
    pub fn open_in_memory() -> Result<Self, LibraryError> {
        let library = Library {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Initialize the database schema.
    /// Creates all necessary tables and indexes if they don't exist.
    fn init_schema(&self) -> Result<(), LibraryError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS images (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path           TEXT NOT NULL UNIQUE,
                width               INTEGER,
                height              INTEGER,
                status              TEXT NOT NULL DEFAULT 'NONE',
                submission_id       TEXT,
                job_id              TEXT,
                result_url          TEXT,
                failure_reason      TEXT,
                ra_center           REAL,
                dec_center          REAL,
                pixel_scale         REAL,
                rotation            REAL,
                parity              INTEGER,
                field_radius        REAL,
                solution_imported   INTEGER NOT NULL DEFAULT 0,
                updated_at          INTEGER NOT NULL,
                wcs_header          TEXT
            )",
            [],
        )?;

        // Databases created before the WCS header was kept
        let has_wcs_header = conn
            .prepare("SELECT 1 FROM pragma_table_info('images') WHERE name = 'wcs_header'")?
            .exists([])?;
        if !has_wcs_header {
            conn.execute("ALTER TABLE images ADD COLUMN wcs_header TEXT", [])?;
            info!("Added wcs_header column to images");
        }

        // Static reference data, one table for every catalog
        conn.execute(
            "CREATE TABLE IF NOT EXISTS catalog_objects (
                catalog_type    TEXT NOT NULL,
                designation     TEXT NOT NULL,
                ra              REAL NOT NULL,
                dec             REAL NOT NULL,
                common_name     TEXT,
                object_type     TEXT,
                magnitude       REAL,
                PRIMARY KEY (catalog_type, designation)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS image_catalog_matches (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                image_id            INTEGER NOT NULL,
                catalog_type        TEXT NOT NULL,
                designation         TEXT NOT NULL,
                angular_separation  REAL NOT NULL,
                pixel_x             REAL,
                pixel_y             REAL,
                confidence          REAL NOT NULL,
                matched_at          INTEGER NOT NULL,
                FOREIGN KEY(image_id) REFERENCES images(id) ON DELETE CASCADE,
                UNIQUE (image_id, catalog_type, designation)
            )",
            [],
        )?;

        // Audit trail of every status change
        conn.execute(
            "CREATE TABLE IF NOT EXISTS status_transitions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                image_id    INTEGER NOT NULL,
                from_status TEXT NOT NULL,
                to_status   TEXT NOT NULL,
                reason      TEXT,
                at          INTEGER NOT NULL,
                FOREIGN KEY(image_id) REFERENCES images(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_images_status_updated
             ON images(status, updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_catalog_objects_dec
             ON catalog_objects(catalog_type, dec)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matches_image_id
             ON image_catalog_matches(image_id)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Get the path to the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Catalog a new image in status NONE
    /// Returns the new image ID
    pub fn insert_image(&self, image: &NewImage) -> Result<i64, LibraryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO images (file_path, width, height, ra_center, dec_center, pixel_scale,
                                 rotation, parity, field_radius, solution_imported, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                image.file_path,
                image.width,
                image.height,
                image.ra_center,
                image.dec_center,
                image.pixel_scale,
                image.rotation,
                image.parity,
                image.field_radius,
                image.solution_imported,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn image(&self, id: i64) -> Result<Image, LibraryError> {
        let conn = self.conn.lock();
        Self::load_image(&conn, id)
    }

    fn load_image(conn: &Connection, id: i64) -> Result<Image, LibraryError> {
        conn.query_row(
            &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
            [id],
            image_from_row,
        )
        .optional()?
        .ok_or(LibraryError::ImageNotFound(id))
    }

    /// All images whose path starts with `scope`; an empty scope is the whole library
    pub fn images_in_scope(&self, scope: &str) -> Result<Vec<Image>, LibraryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images
             WHERE substr(file_path, 1, length(?1)) = ?1
             ORDER BY id"
        ))?;
        let images = stmt
            .query_map([scope], image_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    /// Move an image to SUBMITTED ahead of an upload, clearing the previous
    /// attempt's handles. Returns the status it was claimed from.
    ///
    /// This is the single-submission guard: an image already SUBMITTED or
    /// PROCESSING cannot be claimed again.
    pub fn claim_submission(
        &self,
        id: i64,
        force: bool,
        reason: Option<&str>,
    ) -> Result<AstrometryStatus, LibraryError> {
        self.transition(id, AstrometryStatus::Submitted, force, reason, |tx, _| {
            tx.execute(
                "UPDATE images SET submission_id = NULL, job_id = NULL, result_url = NULL,
                                   failure_reason = NULL, wcs_header = NULL
                 WHERE id = ?1",
                [id],
            )
            .map(|_| ())
        })
    }

    /// Record the provider's handle for a claimed image
    pub fn set_submission_id(&self, id: i64, submission_id: &str) -> Result<(), LibraryError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE images SET submission_id = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                submission_id,
                Utc::now().timestamp_millis(),
                id,
                AstrometryStatus::Submitted
            ],
        )?;
        if changed == 0 {
            let current = Self::load_image(&conn, id)?.status;
            return Err(LibraryError::InvalidTransition {
                id,
                from: current,
                to: AstrometryStatus::Submitted,
            });
        }
        Ok(())
    }

    /// Refresh `updated_at` on an in-flight image so the stale sweep leaves it
    /// alone. Returns false once the image is no longer in flight.
    pub fn heartbeat(&self, id: i64) -> Result<bool, LibraryError> {
        let changed = self.conn.lock().execute(
            "UPDATE images SET updated_at = ?1
             WHERE id = ?2 AND status IN (?3, ?4)",
            params![
                Utc::now().timestamp_millis(),
                id,
                AstrometryStatus::Submitted,
                AstrometryStatus::Processing
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_processing(&self, id: i64, job_id: &str) -> Result<(), LibraryError> {
        self.transition(id, AstrometryStatus::Processing, false, None, |tx, _| {
            tx.execute(
                "UPDATE images SET job_id = ?1 WHERE id = ?2",
                params![job_id, id],
            )
            .map(|_| ())
        })
        .map(|_| ())
    }

    pub fn mark_failed(&self, id: i64, reason: &str) -> Result<(), LibraryError> {
        self.transition(id, AstrometryStatus::Failed, false, Some(reason), |tx, _| {
            tx.execute(
                "UPDATE images SET failure_reason = ?1 WHERE id = ?2",
                params![reason, id],
            )
            .map(|_| ())
        })
        .map(|_| ())
    }

    /// Store a solution and move the image to SOLVED
    pub fn mark_solved(
        &self,
        id: i64,
        calibration: &Calibration,
        result_url: Option<&str>,
        wcs_header: Option<&WcsHeader>,
    ) -> Result<(), LibraryError> {
        let wcs_header = wcs_header.map(serde_json::to_string).transpose()?;
        self.transition(id, AstrometryStatus::Solved, false, None, |tx, _| {
            tx.execute(
                "UPDATE images SET ra_center = ?1, dec_center = ?2, pixel_scale = ?3,
                                   rotation = ?4, parity = ?5,
                                   field_radius = COALESCE(?6, field_radius),
                                   result_url = ?7, failure_reason = NULL, wcs_header = ?8
                 WHERE id = ?9",
                params![
                    calibration.ra.degrees(),
                    calibration.dec.degrees(),
                    calibration.pixel_scale.arcsec(),
                    calibration.orientation.degrees(),
                    calibration.parity.sign() as i8,
                    calibration.radius.map(|r| r.degrees()),
                    result_url,
                    wcs_header,
                    id,
                ],
            )
            .map(|_| ())
        })
        .map(|_| ())
    }

    /// Fail every in-flight image not touched since `cutoff`.
    /// Returns the images as they were before the sweep.
    pub fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Image>, LibraryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {IMAGE_COLUMNS} FROM images
                 WHERE status IN (?1, ?2) AND updated_at < ?3
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                params![
                    AstrometryStatus::Submitted,
                    AstrometryStatus::Processing,
                    cutoff.timestamp_millis()
                ],
                image_from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let now = Utc::now().timestamp_millis();
        for image in &stale {
            tx.execute(
                "UPDATE images SET status = ?1, failure_reason = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![AstrometryStatus::Failed, reason, now, image.id],
            )?;
            record_transition(&tx, image.id, image.status, AstrometryStatus::Failed, Some(reason), now)?;
        }
        tx.commit()?;
        Ok(stale)
    }

    /// Move `id` to `to` if the status graph allows it, running `apply` in the
    /// same transaction. Returns the previous status.
    ///
    /// Leaving SOLVED drops the image's matches unless its solution was imported.
    fn transition<F>(
        &self,
        id: i64,
        to: AstrometryStatus,
        force: bool,
        reason: Option<&str>,
        apply: F,
    ) -> Result<AstrometryStatus, LibraryError>
    where
        F: FnOnce(&Transaction<'_>, i64) -> rusqlite::Result<()>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (from, imported): (AstrometryStatus, bool) = tx
            .query_row(
                "SELECT status, solution_imported FROM images WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(LibraryError::ImageNotFound(id))?;

        if !from.can_transition_to(to, force) {
            return Err(LibraryError::InvalidTransition { id, from, to });
        }

        let now = Utc::now().timestamp_millis();
        tx.execute(
            "UPDATE images SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![to, now, id],
        )?;
        apply(&tx, now)?;
        if to != AstrometryStatus::Solved && !imported {
            clear_matches(&tx, id)?;
        }
        record_transition(&tx, id, from, to, reason, now)?;
        tx.commit()?;

        debug!("image {id}: {from} -> {to}");
        Ok(from)
    }

    /// Audit trail for an image, oldest first
    pub fn transitions(&self, image_id: i64) -> Result<Vec<StatusTransition>, LibraryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT from_status, to_status, reason, at FROM status_transitions
             WHERE image_id = ?1 ORDER BY id",
        )?;
        let transitions = stmt
            .query_map([image_id], |row| {
                Ok(StatusTransition {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    reason: row.get(2)?,
                    at: timestamp(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transitions)
    }

    /// Add or replace a reference object
    pub fn insert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), LibraryError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO catalog_objects
                (catalog_type, designation, ra, dec, common_name, object_type, magnitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.catalog,
                entry.designation,
                entry.ra,
                entry.dec,
                entry.common_name,
                entry.object_type,
                entry.magnitude,
            ],
        )?;
        Ok(())
    }

    pub fn catalog_entry(
        &self,
        catalog: CatalogType,
        designation: &str,
    ) -> Result<Option<CatalogEntry>, LibraryError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {CATALOG_COLUMNS} FROM catalog_objects
                     WHERE catalog_type = ?1 AND designation = ?2"
                ),
                params![catalog, designation],
                catalog_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Objects of one catalog within `radius` degrees of `center`, closest first,
    /// paired with their separation in degrees.
    pub fn catalog_entries_near(
        &self,
        catalog: CatalogType,
        center: AstroCoord,
        radius: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(CatalogEntry, f64)>, LibraryError> {
        let dec = center.dec().degrees();
        let conn = self.conn.lock();
        // Declination band first, exact distance below
        let mut stmt = conn.prepare(&format!(
            "SELECT {CATALOG_COLUMNS} FROM catalog_objects
             WHERE catalog_type = ?1 AND dec BETWEEN ?2 AND ?3"
        ))?;
        let rows = stmt.query_map(
            params![catalog, dec - radius, dec + radius],
            catalog_entry_from_row,
        )?;

        let mut found = Vec::new();
        for entry in rows {
            let entry = entry?;
            let separation = center.separation(&entry.position()).degrees();
            if separation <= radius {
                found.push((entry, separation));
            }
        }
        found.sort_by(|a, b| a.1.total_cmp(&b.1));
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    /// Swap the image's matches for `matches` in one transaction.
    /// The image must be plate solved when the swap happens.
    pub fn replace_matches(
        &self,
        image_id: i64,
        matches: &[NewMatch],
    ) -> Result<usize, LibraryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let solved: bool = tx
            .query_row(
                "SELECT status = ?1 OR solution_imported FROM images WHERE id = ?2",
                params![AstrometryStatus::Solved, image_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LibraryError::ImageNotFound(image_id))?;
        if !solved {
            return Err(LibraryError::NotPlateSolved(image_id));
        }
        clear_matches(&tx, image_id)?;
        let now = Utc::now().timestamp_millis();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO image_catalog_matches
                    (image_id, catalog_type, designation, angular_separation,
                     pixel_x, pixel_y, confidence, matched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for m in matches {
                stmt.execute(params![
                    image_id,
                    m.catalog,
                    m.designation,
                    m.angular_separation,
                    m.pixel_x,
                    m.pixel_y,
                    m.confidence,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(matches.len())
    }

    pub fn matches_for_image(&self, image_id: i64) -> Result<Vec<ImageCatalogMatch>, LibraryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MATCH_COLUMNS} FROM image_catalog_matches
             WHERE image_id = ?1 ORDER BY angular_separation, id"
        ))?;
        let matches = stmt
            .query_map([image_id], |row| {
                Ok(ImageCatalogMatch {
                    id: row.get(0)?,
                    image_id: row.get(1)?,
                    catalog: row.get(2)?,
                    designation: row.get(3)?,
                    angular_separation: row.get(4)?,
                    pixel_x: row.get(5)?,
                    pixel_y: row.get(6)?,
                    confidence: row.get(7)?,
                    matched_at: timestamp(row, 8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    /// Overwrite stored pixel positions, keyed by match id
    pub fn update_match_pixels(
        &self,
        updates: &[(i64, Option<(f64, f64)>)],
    ) -> Result<usize, LibraryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE image_catalog_matches SET pixel_x = ?1, pixel_y = ?2 WHERE id = ?3",
            )?;
            for (id, pixel) in updates {
                changed += stmt.execute(params![pixel.map(|p| p.0), pixel.map(|p| p.1), id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

fn clear_matches(tx: &Transaction<'_>, image_id: i64) -> rusqlite::Result<()> {
    let removed = tx.execute(
        "DELETE FROM image_catalog_matches WHERE image_id = ?1",
        [image_id],
    )?;
    if removed > 0 {
        debug!("image {image_id}: dropped {removed} catalog matches");
    }
    Ok(())
}

fn record_transition(
    tx: &Transaction<'_>,
    image_id: i64,
    from: AstrometryStatus,
    to: AstrometryStatus,
    reason: Option<&str>,
    at: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO status_transitions (image_id, from_status, to_status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![image_id, from, to, reason, at],
    )?;
    Ok(())
}

/// Timestamps are stored as unix milliseconds
fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn catalog_entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        catalog: row.get(0)?,
        designation: row.get(1)?,
        ra: row.get(2)?,
        dec: row.get(3)?,
        common_name: row.get(4)?,
        object_type: row.get(5)?,
        magnitude: row.get(6)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        file_path: row.get(1)?,
        width: row.get(2)?,
        height: row.get(3)?,
        status: row.get(4)?,
        submission_id: row.get(5)?,
        job_id: row.get(6)?,
        result_url: row.get(7)?,
        failure_reason: row.get(8)?,
        ra_center: row.get(9)?,
        dec_center: row.get(10)?,
        pixel_scale: row.get(11)?,
        rotation: row.get(12)?,
        parity: row.get(13)?,
        field_radius: row.get(14)?,
        solution_imported: row.get(15)?,
        updated_at: timestamp(row, 16)?,
        wcs_header: json_column(row, 17)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Image {0} not found")]
    ImageNotFound(i64),
    #[error("Image {0} is not plate solved")]
    NotPlateSolved(i64),
    #[error("Image {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: AstrometryStatus,
        to: AstrometryStatus,
    },
}
