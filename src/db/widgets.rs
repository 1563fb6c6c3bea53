use super::{parse_time, tables, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{
    GridLayout, PinWidgetPayload, PinnedWidget, QueryDescriptor, WidgetLayoutItem, DEFAULT_WIDGET_HEIGHT,
    DEFAULT_WIDGET_WIDTH,
};
use crate::transport::ChangeKind;
use crate::widgets::WidgetBackend;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

const MAX_TITLE_CHARS: usize = 80;

const WIDGET_COLUMNS: &str = "id, owner_id, component_name, query_id, params_json, title,
     grid_x, grid_y, grid_w, grid_h, min_w, min_h, created_at, updated_at";

impl Database {
    pub fn list_widgets(&self, owner_id: &str) -> AppResult<Vec<PinnedWidget>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pinned_widgets WHERE owner_id = ?1 ORDER BY grid_y ASC, grid_x ASC, created_at ASC",
            WIDGET_COLUMNS
        ))?;
        let rows = stmt.query_map([owner_id], parse_widget_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_widget(&self, owner_id: &str, widget_id: &str) -> AppResult<Option<PinnedWidget>> {
        let conn = self.conn()?;
        let widget = conn
            .query_row(
                &format!("SELECT {} FROM pinned_widgets WHERE id = ?1 AND owner_id = ?2", WIDGET_COLUMNS),
                [widget_id, owner_id],
                parse_widget_row,
            )
            .optional()?;
        Ok(widget)
    }

    pub fn pin_widget(&self, payload: &PinWidgetPayload) -> AppResult<PinnedWidget> {
        let owner_id = require_owner(&payload.owner_id)?;
        let component_name = payload.component_name.trim();
        if component_name.is_empty() {
            return Err(AppError::InvalidParams("componentName is required".to_string()));
        }
        if payload.query_descriptor.query_id.trim().is_empty() {
            return Err(AppError::InvalidParams("queryDescriptor.queryId is required".to_string()));
        }
        let title = normalize_widget_title(&payload.title)?;
        if let Some(layout) = payload.layout.as_ref() {
            layout.validate()?;
        }
        let params_json = serde_json::to_string(&payload.query_descriptor.params)?;

        let widget = {
            let conn = self.conn()?;
            let layout = match payload.layout {
                Some(layout) => layout,
                None => {
                    let next_row: i64 = conn.query_row(
                        "SELECT COALESCE(MAX(grid_y + grid_h), 0) FROM pinned_widgets WHERE owner_id = ?1",
                        [owner_id],
                        |row| row.get(0),
                    )?;
                    let next_row = i32::try_from(next_row).unwrap_or(i32::MAX);
                    let layout = GridLayout::new(0, next_row, DEFAULT_WIDGET_WIDTH, DEFAULT_WIDGET_HEIGHT);
                    layout
                        .validate()
                        .map_err(|_| AppError::Policy("no room left on the dashboard grid".to_string()))?;
                    layout
                }
            };

            let now = Utc::now();
            let widget = PinnedWidget {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                component_name: component_name.to_string(),
                query_descriptor: payload.query_descriptor.clone(),
                title,
                layout,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO pinned_widgets (
                   id, owner_id, component_name, query_id, params_json, title,
                   grid_x, grid_y, grid_w, grid_h, min_w, min_h, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    widget.id,
                    widget.owner_id,
                    widget.component_name,
                    widget.query_descriptor.query_id,
                    params_json,
                    widget.title,
                    layout.x,
                    layout.y,
                    layout.w,
                    layout.h,
                    layout.min_w,
                    layout.min_h,
                    now.to_rfc3339(),
                ],
            )?;
            widget
        };

        tracing::debug!(widget_id = %widget.id, owner_id = %widget.owner_id, "pinned widget");
        self.publish(&[tables::PINNED_WIDGETS], ChangeKind::Insert, Some(&widget.id));
        Ok(widget)
    }

    pub fn unpin_widget(&self, owner_id: &str, widget_id: &str) -> AppResult<bool> {
        let owner_id = require_owner(owner_id)?;
        let removed = {
            let conn = self.conn()?;
            conn.execute(
                "DELETE FROM pinned_widgets WHERE id = ?1 AND owner_id = ?2",
                [widget_id, owner_id],
            )?
        };
        if removed > 0 {
            self.publish(&[tables::PINNED_WIDGETS], ChangeKind::Delete, Some(widget_id));
        }
        Ok(removed > 0)
    }

    pub fn rename_widget(&self, owner_id: &str, widget_id: &str, title: &str) -> AppResult<PinnedWidget> {
        let owner_id = require_owner(owner_id)?;
        let title = normalize_widget_title(title)?;
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE pinned_widgets SET title = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
                params![title, Utc::now().to_rfc3339(), widget_id, owner_id],
            )?
        };
        if changed == 0 {
            return Err(AppError::NotFound(format!("widget {}", widget_id)));
        }
        self.publish(&[tables::PINNED_WIDGETS], ChangeKind::Update, Some(widget_id));
        self.get_widget(owner_id, widget_id)?
            .ok_or_else(|| AppError::NotFound(format!("widget {}", widget_id)))
    }

    // Writes every layout in one transaction. An id the owner does not have
    // aborts the whole batch.
    pub fn save_widget_layouts(&self, owner_id: &str, layouts: &[WidgetLayoutItem]) -> AppResult<usize> {
        let owner_id = require_owner(owner_id)?;
        if layouts.is_empty() {
            return Ok(0);
        }
        for item in layouts {
            item.layout.validate()?;
        }

        {
            let now = Utc::now().to_rfc3339();
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for item in layouts {
                let changed = tx.execute(
                    "UPDATE pinned_widgets
                     SET grid_x = ?1, grid_y = ?2, grid_w = ?3, grid_h = ?4, min_w = ?5, min_h = ?6, updated_at = ?7
                     WHERE id = ?8 AND owner_id = ?9",
                    params![
                        item.layout.x,
                        item.layout.y,
                        item.layout.w,
                        item.layout.h,
                        item.layout.min_w,
                        item.layout.min_h,
                        now,
                        item.id,
                        owner_id,
                    ],
                )?;
                if changed == 0 {
                    return Err(AppError::NotFound(format!("widget {}", item.id)));
                }
            }
            tx.commit()?;
        }

        self.publish(&[tables::PINNED_WIDGETS], ChangeKind::Update, None);
        Ok(layouts.len())
    }

    pub fn clear_widgets(&self, owner_id: &str) -> AppResult<u64> {
        let owner_id = require_owner(owner_id)?;
        let removed = {
            let conn = self.conn()?;
            conn.execute("DELETE FROM pinned_widgets WHERE owner_id = ?1", [owner_id])?
        };
        if removed > 0 {
            self.publish(&[tables::PINNED_WIDGETS], ChangeKind::Delete, None);
        }
        Ok(removed as u64)
    }
}

impl WidgetBackend for Database {
    fn list_widgets(&self, owner_id: &str) -> AppResult<Vec<PinnedWidget>> {
        Database::list_widgets(self, owner_id)
    }

    fn pin_widget(&self, payload: &PinWidgetPayload) -> AppResult<PinnedWidget> {
        Database::pin_widget(self, payload)
    }

    fn unpin_widget(&self, owner_id: &str, widget_id: &str) -> AppResult<bool> {
        Database::unpin_widget(self, owner_id, widget_id)
    }

    fn rename_widget(&self, owner_id: &str, widget_id: &str, title: &str) -> AppResult<PinnedWidget> {
        Database::rename_widget(self, owner_id, widget_id, title)
    }

    fn save_widget_layouts(&self, owner_id: &str, layouts: &[WidgetLayoutItem]) -> AppResult<usize> {
        Database::save_widget_layouts(self, owner_id, layouts)
    }

    fn clear_widgets(&self, owner_id: &str) -> AppResult<u64> {
        Database::clear_widgets(self, owner_id)
    }
}

fn require_owner(owner_id: &str) -> AppResult<&str> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(AppError::InvalidParams("ownerId is required".to_string()));
    }
    Ok(owner_id)
}

fn normalize_widget_title(raw: &str) -> AppResult<String> {
    let first_line = raw.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return Err(AppError::InvalidParams("widget title is required".to_string()));
    }
    if first_line.chars().count() <= MAX_TITLE_CHARS {
        return Ok(first_line.to_string());
    }
    let truncated: String = first_line.chars().take(MAX_TITLE_CHARS - 3).collect();
    Ok(format!("{}...", truncated.trim_end()))
}

fn parse_widget_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PinnedWidget> {
    let params_json: String = row.get(4)?;
    let params = serde_json::from_str(&params_json).map_err(|error| super::invalid_data(error.to_string()))?;
    Ok(PinnedWidget {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        component_name: row.get(2)?,
        query_descriptor: QueryDescriptor {
            query_id: row.get(3)?,
            params,
        },
        title: row.get(5)?,
        layout: GridLayout {
            x: row.get(6)?,
            y: row.get(7)?,
            w: row.get(8)?,
            h: row.get(9)?,
            min_w: row.get(10)?,
            min_h: row.get(11)?,
        },
        created_at: parse_time(&row.get::<_, String>(12)?)?,
        updated_at: parse_time(&row.get::<_, String>(13)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::normalize_widget_title;
    use crate::db::test_database;
    use crate::errors::AppError;
    use crate::models::{GridLayout, PinWidgetPayload, QueryDescriptor, WidgetLayoutItem, MAX_GRID_EXTENT};

    fn payload(owner_id: &str, title: &str) -> PinWidgetPayload {
        PinWidgetPayload {
            owner_id: owner_id.to_string(),
            component_name: "LeaveBalanceCard".to_string(),
            query_descriptor: QueryDescriptor::new("leaveBalance").with_param("employeeId", "ZP-1001"),
            title: title.to_string(),
            layout: None,
        }
    }

    #[test]
    fn new_pins_stack_below_existing_widgets() {
        let (_dir, db) = test_database();
        let first = db.pin_widget(&payload("ZP-1001", "Leave")).expect("first");
        let second = db.pin_widget(&payload("ZP-1001", "Leave again")).expect("second");
        assert_eq!(first.layout, GridLayout::new(0, 0, 4, 3));
        assert_eq!(second.layout, GridLayout::new(0, 3, 4, 3));

        let listed = db.list_widgets("ZP-1001").expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].query_descriptor, first.query_descriptor);
        assert!(db.list_widgets("ZP-1002").expect("other owner").is_empty());
    }

    #[test]
    fn oversized_layouts_never_break_default_placement() {
        let (_dir, db) = test_database();
        let huge = PinWidgetPayload {
            layout: Some(GridLayout::new(0, 2_000_000_000, 4, 200_000_000)),
            ..payload("ZP-1001", "Far away")
        };
        assert!(matches!(db.pin_widget(&huge), Err(AppError::InvalidParams(_))));

        let bottom_edge = PinWidgetPayload {
            layout: Some(GridLayout::new(0, MAX_GRID_EXTENT - 3, 4, 3)),
            ..payload("ZP-1001", "Bottom row")
        };
        db.pin_widget(&bottom_edge).expect("pin at the last rows");
        assert!(matches!(
            db.pin_widget(&payload("ZP-1001", "No room")),
            Err(AppError::Policy(_))
        ));
        assert_eq!(
            db.pin_widget(&payload("ZP-1002", "Other owner")).expect("other owner").layout,
            GridLayout::new(0, 0, 4, 3)
        );
    }

    #[test]
    fn mutations_are_scoped_to_the_owner() {
        let (_dir, db) = test_database();
        let widget = db.pin_widget(&payload("ZP-1001", "Leave")).expect("pin");

        assert!(!db.unpin_widget("ZP-1002", &widget.id).expect("foreign unpin"));
        assert!(matches!(
            db.rename_widget("ZP-1002", &widget.id, "Mine now"),
            Err(AppError::NotFound(_))
        ));

        let renamed = db.rename_widget("ZP-1001", &widget.id, "  My leave  ").expect("rename");
        assert_eq!(renamed.title, "My leave");
        assert!(db.unpin_widget("ZP-1001", &widget.id).expect("unpin"));
        assert!(!db.unpin_widget("ZP-1001", &widget.id).expect("second unpin"));
    }

    #[test]
    fn batch_layouts_are_all_or_nothing() {
        let (_dir, db) = test_database();
        let w1 = db.pin_widget(&payload("ZP-1001", "One")).expect("w1");
        let w2 = db.pin_widget(&payload("ZP-1001", "Two")).expect("w2");

        let failed = db
            .save_widget_layouts(
                "ZP-1001",
                &[
                    WidgetLayoutItem {
                        id: w1.id.clone(),
                        layout: GridLayout::new(4, 0, 4, 3),
                    },
                    WidgetLayoutItem {
                        id: "missing".to_string(),
                        layout: GridLayout::new(0, 9, 4, 3),
                    },
                ],
            )
            .expect_err("unknown id");
        assert!(matches!(failed, AppError::NotFound(_)));
        let unchanged = db.get_widget("ZP-1001", &w1.id).expect("get").expect("exists");
        assert_eq!(unchanged.layout, w1.layout);

        let saved = db
            .save_widget_layouts(
                "ZP-1001",
                &[
                    WidgetLayoutItem {
                        id: w1.id.clone(),
                        layout: GridLayout::new(4, 0, 4, 3),
                    },
                    WidgetLayoutItem {
                        id: w2.id.clone(),
                        layout: GridLayout::new(0, 0, 4, 6),
                    },
                ],
            )
            .expect("save");
        assert_eq!(saved, 2);
        let moved = db.get_widget("ZP-1001", &w2.id).expect("get").expect("exists");
        assert_eq!(moved.layout.h, 6);

        let invalid = db.save_widget_layouts(
            "ZP-1001",
            &[WidgetLayoutItem {
                id: w1.id.clone(),
                layout: GridLayout::new(0, 0, 0, 3),
            }],
        );
        assert!(matches!(invalid, Err(AppError::InvalidParams(_))));
    }

    #[test]
    fn clear_removes_only_the_owners_widgets() {
        let (_dir, db) = test_database();
        db.pin_widget(&payload("ZP-1001", "One")).expect("one");
        db.pin_widget(&payload("ZP-1001", "Two")).expect("two");
        db.pin_widget(&payload("ZP-2001", "Manager")).expect("manager");

        assert_eq!(db.clear_widgets("ZP-1001").expect("clear"), 2);
        assert_eq!(db.list_widgets("ZP-2001").expect("list").len(), 1);
        assert!(matches!(db.clear_widgets("  "), Err(AppError::InvalidParams(_))));
    }

    #[test]
    fn titles_are_trimmed_and_capped() {
        assert!(normalize_widget_title("   ").is_err());
        assert_eq!(normalize_widget_title(" Leave \nsecond line").expect("title"), "Leave");
        let long = "x".repeat(200);
        let capped = normalize_widget_title(&long).expect("long");
        assert_eq!(capped.chars().count(), 80);
        assert!(capped.ends_with("..."));
    }
}
