use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::models::{GrowArea, GrowAreaKind, Plant, PlantPhase};

/// Read side of the data store: the current grow areas with their plants.
///
/// Implementations must be side-effect free from the caller's point of view.
/// The discovery pass calls this from its own thread, hence `Send + Sync`.
pub trait EntityDirectory: Send + Sync {
    fn fetch_entity_directory(&self) -> Result<Vec<GrowArea>>;
}

pub struct NewGrowArea<'a> {
    pub name: &'a str,
    pub kind: GrowAreaKind,
    pub automation_enabled: bool,
}

pub struct NewPlant<'a> {
    pub grow_area_id: i64,
    pub name: &'a str,
    pub strain: &'a str,
    pub phases: &'a [PlantPhase],
}

/// SQLite-backed directory. A connection is opened per call so the handle
/// itself stays `Sync`.
pub struct SqliteEntityDirectory {
    db_path: String,
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

impl SqliteEntityDirectory {
    pub fn open(db_path: &str) -> Result<Self> {
        let directory = Self {
            db_path: db_path.to_string(),
        };
        let conn = directory.connect()?;
        ensure_schema(&conn)?;
        Ok(directory)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = open_db_connection(&self.db_path)
            .with_context(|| format!("failed to open directory database {}", self.db_path))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    pub fn insert_grow_area(&self, area: &NewGrowArea<'_>) -> Result<i64> {
        if area.name.trim().is_empty() {
            return Err(anyhow!("grow area name must not be empty"));
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO grow_areas(name, kind, automation_enabled) VALUES (?1, ?2, ?3)",
            params![area.name, area.kind.as_str(), area.automation_enabled],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_plant(&self, plant: &NewPlant<'_>) -> Result<i64> {
        if plant.name.trim().is_empty() {
            return Err(anyhow!("plant name must not be empty"));
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM grow_areas WHERE id = ?1",
            params![plant.grow_area_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(anyhow!("grow area {} does not exist", plant.grow_area_id));
        }
        tx.execute(
            "INSERT INTO plants(grow_area_id, name, strain, is_active) VALUES (?1, ?2, ?3, 1)",
            params![plant.grow_area_id, plant.name, plant.strain],
        )?;
        let plant_id = tx.last_insert_rowid();
        for (position, phase) in plant.phases.iter().enumerate() {
            let start = phase
                .start_epoch_s
                .map(i64::try_from)
                .transpose()
                .map_err(|_| anyhow!("phase start exceeds i64 range"))?;
            tx.execute(
                r#"
                INSERT INTO plant_phases(
                  plant_id, position, name, start_epoch_s,
                  duration_min, duration_max, is_active, is_completed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    plant_id,
                    position as i64,
                    phase.name,
                    start,
                    phase.duration_min,
                    phase.duration_max,
                    phase.is_active,
                    phase.is_completed
                ],
            )?;
        }
        tx.commit()?;
        Ok(plant_id)
    }

    /// Returns whether a row was removed. Plants and phases cascade.
    pub fn delete_grow_area(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM grow_areas WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn delete_plant(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM plants WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn plant_ids_for_area(&self, grow_area_id: i64) -> Result<Vec<i64>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id FROM plants WHERE grow_area_id = ?1 ORDER BY id ASC")?;
        let ids = stmt
            .query_map(params![grow_area_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS grow_areas (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          kind TEXT NOT NULL DEFAULT 'indoor',
          automation_enabled INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS plants (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          grow_area_id INTEGER NOT NULL REFERENCES grow_areas(id) ON DELETE CASCADE,
          name TEXT NOT NULL,
          strain TEXT NOT NULL DEFAULT '',
          is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS plant_phases (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          plant_id INTEGER NOT NULL REFERENCES plants(id) ON DELETE CASCADE,
          position INTEGER NOT NULL,
          name TEXT NOT NULL,
          start_epoch_s INTEGER,
          duration_min INTEGER NOT NULL DEFAULT 0,
          duration_max INTEGER NOT NULL DEFAULT 0,
          is_active INTEGER NOT NULL DEFAULT 0,
          is_completed INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_plants_area ON plants(grow_area_id);
        CREATE INDEX IF NOT EXISTS idx_phases_plant ON plant_phases(plant_id, position);
        "#,
    )?;
    Ok(())
}

impl EntityDirectory for SqliteEntityDirectory {
    fn fetch_entity_directory(&self) -> Result<Vec<GrowArea>> {
        let conn = self.connect()?;

        let mut phases: HashMap<i64, Vec<PlantPhase>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                r#"
                SELECT plant_id, name, start_epoch_s, duration_min, duration_max,
                       is_active, is_completed
                FROM plant_phases ORDER BY plant_id ASC, position ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let plant_id: i64 = row.get(0)?;
                let start: Option<i64> = row.get(2)?;
                let start_epoch_s = start
                    .map(u64::try_from)
                    .transpose()
                    .map_err(|_| anyhow!("corrupt phase row: negative start for plant {}", plant_id))?;
                phases.entry(plant_id).or_default().push(PlantPhase {
                    name: row.get(1)?,
                    start_epoch_s,
                    duration_min: row.get(3)?,
                    duration_max: row.get(4)?,
                    is_active: row.get(5)?,
                    is_completed: row.get(6)?,
                });
            }
        }

        let mut plants: HashMap<i64, Vec<Plant>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, grow_area_id, name, strain, is_active FROM plants ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let grow_area_id: i64 = row.get(1)?;
                plants.entry(grow_area_id).or_default().push(Plant {
                    id,
                    grow_area_id,
                    name: row.get(2)?,
                    strain: row.get(3)?,
                    is_active: row.get(4)?,
                    phases: phases.remove(&id).unwrap_or_default(),
                });
            }
        }

        let mut stmt = conn
            .prepare("SELECT id, name, kind, automation_enabled FROM grow_areas ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let kind: String = row.get(2)?;
            out.push(GrowArea {
                id,
                name: row.get(1)?,
                kind: kind.parse()?,
                automation_enabled: row.get(3)?,
                plants: plants.remove(&id).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

/// Directory held in memory. Can be told to fail, to exercise the
/// fetch-error path of the discovery pass.
#[derive(Debug, Default)]
pub struct InMemoryEntityDirectory {
    areas: Mutex<Vec<GrowArea>>,
    failing: AtomicBool,
}

impl InMemoryEntityDirectory {
    pub fn new(areas: Vec<GrowArea>) -> Self {
        Self {
            areas: Mutex::new(areas),
            failing: AtomicBool::new(false),
        }
    }

    pub fn replace(&self, areas: Vec<GrowArea>) {
        if let Ok(mut guard) = self.areas.lock() {
            *guard = areas;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EntityDirectory for InMemoryEntityDirectory {
    fn fetch_entity_directory(&self) -> Result<Vec<GrowArea>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("entity directory unavailable"));
        }
        let guard = self
            .areas
            .lock()
            .map_err(|_| anyhow!("entity directory lock poisoned"))?;
        Ok(guard.clone())
    }
}
