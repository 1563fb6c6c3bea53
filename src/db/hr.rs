use super::{format_date, parse_date, parse_time, tables, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{
    Announcement, AttendanceRecord, AttendanceStatus, AttendanceSummary, DecideLeaveRequestPayload, Employee,
    LeaveBalance, LeaveRequestRecord, LeaveStatus, PersonaRole, PostAnnouncementPayload,
    SubmitLeaveRequestPayload,
};
use crate::transport::ChangeKind;
use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const DEFAULT_AUDIENCE: &str = "all";

impl Database {
    // ─── Demo seed ──────────────────────────────────────────────────────────

    pub fn seed_demo_data(&self) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let existing: i64 = conn.query_row("SELECT COUNT(1) FROM employees", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(false);
        }

        let now = Utc::now();
        let today = now.date_naive();
        let tx = conn.transaction()?;

        let people = [
            ("ZP-2001", "Priya Raman", "priya.raman@example.com", PersonaRole::Manager, "Engineering", None),
            ("ZP-3001", "Jonas Weber", "jonas.weber@example.com", PersonaRole::Hr, "People Operations", None),
            (
                "ZP-1001",
                "Amara Okafor",
                "amara.okafor@example.com",
                PersonaRole::Employee,
                "Engineering",
                Some("ZP-2001"),
            ),
            (
                "ZP-1002",
                "Luis Ferreira",
                "luis.ferreira@example.com",
                PersonaRole::Employee,
                "Engineering",
                Some("ZP-2001"),
            ),
        ];
        for (id, name, email, role, department, manager_id) in people {
            tx.execute(
                "INSERT INTO employees (id, name, email, role, department, manager_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, name, email, role.as_str(), department, manager_id],
            )?;
        }

        let balances = [
            ("ZP-1001", "annual", 20.0, 6.0),
            ("ZP-1001", "sick", 10.0, 1.0),
            ("ZP-1002", "annual", 20.0, 12.5),
            ("ZP-1002", "sick", 10.0, 0.0),
            ("ZP-2001", "annual", 25.0, 8.0),
            ("ZP-2001", "sick", 10.0, 2.0),
            ("ZP-3001", "annual", 25.0, 3.0),
            ("ZP-3001", "sick", 10.0, 0.0),
        ];
        for (employee_id, leave_type, total_days, used_days) in balances {
            tx.execute(
                "INSERT INTO leave_balances (employee_id, leave_type, total_days, used_days)
                 VALUES (?1, ?2, ?3, ?4)",
                params![employee_id, leave_type, total_days, used_days],
            )?;
        }

        let start = today + Duration::days(14);
        let end = start + Duration::days(2);
        tx.execute(
            "INSERT INTO leave_requests (id, employee_id, leave_type, start_date, end_date, days, reason, status, created_at)
             VALUES (?1, 'ZP-1002', 'annual', ?2, ?3, 3, 'Family visit', ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                format_date(start),
                format_date(end),
                LeaveStatus::Pending.as_str(),
                now.to_rfc3339()
            ],
        )?;

        let mut day = today;
        let mut seeded_days = 0;
        while seeded_days < 5 {
            day -= Duration::days(1);
            if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            seeded_days += 1;
            for (employee_id, status) in [
                ("ZP-1001", if seeded_days == 2 { AttendanceStatus::Remote } else { AttendanceStatus::Present }),
                ("ZP-1002", if seeded_days == 4 { AttendanceStatus::Absent } else { AttendanceStatus::Present }),
            ] {
                let (check_in, check_out) = match status {
                    AttendanceStatus::Absent | AttendanceStatus::OnLeave => (None, None),
                    _ => (Some("09:00"), Some("17:30")),
                };
                tx.execute(
                    "INSERT INTO attendance (employee_id, work_date, status, check_in, check_out)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![employee_id, format_date(day), status.as_str(), check_in, check_out],
                )?;
            }
        }

        let announcements = [
            ("Open enrollment starts Monday", "Review your benefits elections before the end of the month.", "all"),
            ("Quarterly reviews", "Manager calibration sessions are scheduled for next week.", "managers"),
            ("New leave policy", "Unused annual leave now carries over up to five days.", "all"),
        ];
        for (offset, (title, body, audience)) in announcements.into_iter().enumerate() {
            let published_at = now - Duration::hours(offset as i64 * 24);
            tx.execute(
                "INSERT INTO announcements (id, title, body, audience, author_id, published_at)
                 VALUES (?1, ?2, ?3, ?4, 'ZP-3001', ?5)",
                params![Uuid::new_v4().to_string(), title, body, audience, published_at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        tracing::info!("seeded demo HR data");
        Ok(true)
    }

    // ─── Employees ──────────────────────────────────────────────────────────

    pub fn get_employee(&self, employee_id: &str) -> AppResult<Option<Employee>> {
        let conn = self.conn()?;
        load_employee(&conn, employee_id)
    }

    pub fn employee_profile(&self, employee_id: &str) -> AppResult<Employee> {
        self.get_employee(employee_id)?
            .ok_or_else(|| AppError::NotFound(format!("employee {}", employee_id)))
    }

    pub fn team_directory(&self, manager_id: &str) -> AppResult<Vec<Employee>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, email, role, department, manager_id
             FROM employees WHERE manager_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([manager_id], parse_employee_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── Leave ──────────────────────────────────────────────────────────────

    pub fn leave_balances(&self, employee_id: &str) -> AppResult<Vec<LeaveBalance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT employee_id, leave_type, total_days, used_days
             FROM leave_balances WHERE employee_id = ?1 ORDER BY leave_type ASC",
        )?;
        let rows = stmt.query_map([employee_id], parse_balance_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn leave_requests(&self, employee_id: &str, status: Option<LeaveStatus>) -> AppResult<Vec<LeaveRequestRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT lr.id, lr.employee_id, e.name, lr.leave_type, lr.start_date, lr.end_date, lr.days,
                    lr.reason, lr.status, lr.approver_id, lr.created_at, lr.decided_at
             FROM leave_requests lr
             LEFT JOIN employees e ON e.id = lr.employee_id
             WHERE lr.employee_id = ?1 AND (?2 IS NULL OR lr.status = ?2)
             ORDER BY lr.created_at DESC",
        )?;
        let rows = stmt.query_map(
            params![employee_id, status.map(LeaveStatus::as_str)],
            parse_leave_request_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn pending_approvals(&self, manager_id: &str) -> AppResult<Vec<LeaveRequestRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT lr.id, lr.employee_id, e.name, lr.leave_type, lr.start_date, lr.end_date, lr.days,
                    lr.reason, lr.status, lr.approver_id, lr.created_at, lr.decided_at
             FROM leave_requests lr
             JOIN employees e ON e.id = lr.employee_id
             WHERE e.manager_id = ?1 AND lr.status = ?2
             ORDER BY lr.created_at ASC",
        )?;
        let rows = stmt.query_map(
            params![manager_id, LeaveStatus::Pending.as_str()],
            parse_leave_request_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn submit_leave_request(&self, payload: &SubmitLeaveRequestPayload) -> AppResult<LeaveRequestRecord> {
        if payload.end_date < payload.start_date {
            return Err(AppError::InvalidParams(format!(
                "leave ends ({}) before it starts ({})",
                payload.end_date, payload.start_date
            )));
        }
        let leave_type = payload.leave_type.trim();
        if leave_type.is_empty() {
            return Err(AppError::InvalidParams("leaveType is required".to_string()));
        }
        let days = inclusive_days(payload.start_date, payload.end_date);
        let reason = payload
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        let record = {
            let conn = self.conn()?;
            let employee = load_employee(&conn, &payload.employee_id)?
                .ok_or_else(|| AppError::NotFound(format!("employee {}", payload.employee_id)))?;
            let balance = load_balance(&conn, &payload.employee_id, leave_type)?.ok_or_else(|| {
                AppError::NotFound(format!("{} balance for {}", leave_type, payload.employee_id))
            })?;
            if days > balance.remaining_days {
                return Err(AppError::Policy(format!(
                    "requested {} days of {} leave but only {} remain",
                    days, leave_type, balance.remaining_days
                )));
            }

            let id = Uuid::new_v4().to_string();
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO leave_requests (id, employee_id, leave_type, start_date, end_date, days, reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    payload.employee_id,
                    leave_type,
                    format_date(payload.start_date),
                    format_date(payload.end_date),
                    days,
                    reason,
                    LeaveStatus::Pending.as_str(),
                    created_at.to_rfc3339(),
                ],
            )?;

            LeaveRequestRecord {
                id,
                employee_id: payload.employee_id.clone(),
                employee_name: Some(employee.name),
                leave_type: leave_type.to_string(),
                start_date: payload.start_date,
                end_date: payload.end_date,
                days,
                reason,
                status: LeaveStatus::Pending,
                approver_id: None,
                created_at,
                decided_at: None,
            }
        };

        self.publish(&[tables::LEAVE_REQUESTS], ChangeKind::Insert, Some(&record.id));
        Ok(record)
    }

    pub fn decide_leave_request(&self, payload: &DecideLeaveRequestPayload) -> AppResult<LeaveRequestRecord> {
        let record = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let request = load_leave_request(&tx, &payload.request_id)?
                .ok_or_else(|| AppError::NotFound(format!("leave request {}", payload.request_id)))?;
            if request.status != LeaveStatus::Pending {
                return Err(AppError::Policy(format!(
                    "leave request {} was already {}",
                    request.id,
                    request.status.as_str()
                )));
            }

            let approver = load_employee(&tx, &payload.approver_id)?
                .ok_or_else(|| AppError::NotFound(format!("employee {}", payload.approver_id)))?;
            let employee = load_employee(&tx, &request.employee_id)?
                .ok_or_else(|| AppError::NotFound(format!("employee {}", request.employee_id)))?;
            let is_manager = employee.manager_id.as_deref() == Some(approver.id.as_str());
            if approver.id == employee.id || !(is_manager || approver.role == PersonaRole::Hr) {
                return Err(AppError::Policy(format!(
                    "{} may not decide leave for {}",
                    approver.id, employee.id
                )));
            }

            let status = if payload.approve {
                let balance = load_balance(&tx, &request.employee_id, &request.leave_type)?.ok_or_else(|| {
                    AppError::NotFound(format!("{} balance for {}", request.leave_type, request.employee_id))
                })?;
                if request.days > balance.remaining_days {
                    return Err(AppError::Policy(format!(
                        "approving {} days would exceed the remaining {} days",
                        request.days, balance.remaining_days
                    )));
                }
                tx.execute(
                    "UPDATE leave_balances SET used_days = used_days + ?1 WHERE employee_id = ?2 AND leave_type = ?3",
                    params![request.days, request.employee_id, request.leave_type],
                )?;
                LeaveStatus::Approved
            } else {
                LeaveStatus::Rejected
            };

            let decided_at = Utc::now();
            tx.execute(
                "UPDATE leave_requests SET status = ?1, approver_id = ?2, decided_at = ?3 WHERE id = ?4",
                params![status.as_str(), approver.id, decided_at.to_rfc3339(), request.id],
            )?;
            tx.commit()?;

            LeaveRequestRecord {
                status,
                approver_id: Some(approver.id),
                decided_at: Some(decided_at),
                ..request
            }
        };

        let touched: &[&str] = if record.status == LeaveStatus::Approved {
            &[tables::LEAVE_REQUESTS, tables::LEAVE_BALANCES]
        } else {
            &[tables::LEAVE_REQUESTS]
        };
        self.publish(touched, ChangeKind::Update, Some(&record.id));
        Ok(record)
    }

    // ─── Attendance ─────────────────────────────────────────────────────────

    pub fn attendance_summary(&self, employee_id: &str, month: &str) -> AppResult<AttendanceSummary> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT employee_id, work_date, status, check_in, check_out
             FROM attendance
             WHERE employee_id = ?1 AND substr(work_date, 1, 7) = ?2
             ORDER BY work_date ASC",
        )?;
        let rows = stmt.query_map(params![employee_id, month], parse_attendance_row)?;
        let mut summary = AttendanceSummary {
            employee_id: employee_id.to_string(),
            month: month.to_string(),
            present_days: 0,
            remote_days: 0,
            absent_days: 0,
            leave_days: 0,
            records: Vec::new(),
        };
        for row in rows {
            let record = row?;
            match record.status {
                AttendanceStatus::Present => summary.present_days += 1,
                AttendanceStatus::Remote => summary.remote_days += 1,
                AttendanceStatus::Absent => summary.absent_days += 1,
                AttendanceStatus::OnLeave => summary.leave_days += 1,
            }
            summary.records.push(record);
        }
        Ok(summary)
    }

    pub fn record_attendance(&self, record: &AttendanceRecord) -> AppResult<AttendanceRecord> {
        {
            let conn = self.conn()?;
            if load_employee(&conn, &record.employee_id)?.is_none() {
                return Err(AppError::NotFound(format!("employee {}", record.employee_id)));
            }
            conn.execute(
                "INSERT INTO attendance (employee_id, work_date, status, check_in, check_out)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(employee_id, work_date) DO UPDATE SET
                   status = excluded.status,
                   check_in = excluded.check_in,
                   check_out = excluded.check_out",
                params![
                    record.employee_id,
                    format_date(record.work_date),
                    record.status.as_str(),
                    record.check_in,
                    record.check_out,
                ],
            )?;
        }

        self.publish(&[tables::ATTENDANCE], ChangeKind::Update, Some(&record.employee_id));
        Ok(record.clone())
    }

    // ─── Announcements ──────────────────────────────────────────────────────

    pub fn announcements(&self, audience: Option<&str>, limit: u32) -> AppResult<Vec<Announcement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, body, audience, author_id, published_at
             FROM announcements
             WHERE ?1 IS NULL OR audience = ?1 OR audience = 'all'
             ORDER BY published_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![audience, limit], parse_announcement_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn post_announcement(&self, payload: &PostAnnouncementPayload) -> AppResult<Announcement> {
        let title = payload.title.trim();
        let body = payload.body.trim();
        if title.is_empty() || body.is_empty() {
            return Err(AppError::InvalidParams("announcement title and body are required".to_string()));
        }
        let audience = payload
            .audience
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_AUDIENCE)
            .to_string();

        let announcement = {
            let conn = self.conn()?;
            if load_employee(&conn, &payload.author_id)?.is_none() {
                return Err(AppError::NotFound(format!("employee {}", payload.author_id)));
            }
            let announcement = Announcement {
                id: Uuid::new_v4().to_string(),
                title: title.to_string(),
                body: body.to_string(),
                audience,
                author_id: payload.author_id.clone(),
                published_at: Utc::now(),
            };
            conn.execute(
                "INSERT INTO announcements (id, title, body, audience, author_id, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    announcement.id,
                    announcement.title,
                    announcement.body,
                    announcement.audience,
                    announcement.author_id,
                    announcement.published_at.to_rfc3339(),
                ],
            )?;
            announcement
        };

        self.publish(&[tables::ANNOUNCEMENTS], ChangeKind::Insert, Some(&announcement.id));
        Ok(announcement)
    }
}

fn inclusive_days(start: NaiveDate, end: NaiveDate) -> f64 {
    ((end - start).num_days() + 1) as f64
}

fn load_employee(conn: &Connection, employee_id: &str) -> AppResult<Option<Employee>> {
    let employee = conn
        .query_row(
            "SELECT id, name, email, role, department, manager_id FROM employees WHERE id = ?1",
            [employee_id],
            parse_employee_row,
        )
        .optional()?;
    Ok(employee)
}

fn load_balance(conn: &Connection, employee_id: &str, leave_type: &str) -> AppResult<Option<LeaveBalance>> {
    let balance = conn
        .query_row(
            "SELECT employee_id, leave_type, total_days, used_days
             FROM leave_balances WHERE employee_id = ?1 AND leave_type = ?2",
            [employee_id, leave_type],
            parse_balance_row,
        )
        .optional()?;
    Ok(balance)
}

fn load_leave_request(conn: &Connection, request_id: &str) -> AppResult<Option<LeaveRequestRecord>> {
    let request = conn
        .query_row(
            "SELECT lr.id, lr.employee_id, e.name, lr.leave_type, lr.start_date, lr.end_date, lr.days,
                    lr.reason, lr.status, lr.approver_id, lr.created_at, lr.decided_at
             FROM leave_requests lr
             LEFT JOIN employees e ON e.id = lr.employee_id
             WHERE lr.id = ?1",
            [request_id],
            parse_leave_request_row,
        )
        .optional()?;
    Ok(request)
}

fn parse_employee_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: parse_role(&row.get::<_, String>(3)?)?,
        department: row.get(4)?,
        manager_id: row.get(5)?,
    })
}

fn parse_balance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeaveBalance> {
    let total_days: f64 = row.get(2)?;
    let used_days: f64 = row.get(3)?;
    Ok(LeaveBalance {
        employee_id: row.get(0)?,
        leave_type: row.get(1)?,
        total_days,
        used_days,
        remaining_days: (total_days - used_days).max(0.0),
    })
}

fn parse_leave_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeaveRequestRecord> {
    Ok(LeaveRequestRecord {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        employee_name: row.get(2)?,
        leave_type: row.get(3)?,
        start_date: parse_date(&row.get::<_, String>(4)?)?,
        end_date: parse_date(&row.get::<_, String>(5)?)?,
        days: row.get(6)?,
        reason: row.get(7)?,
        status: parse_leave_status(&row.get::<_, String>(8)?),
        approver_id: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
        decided_at: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_attendance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        employee_id: row.get(0)?,
        work_date: parse_date(&row.get::<_, String>(1)?)?,
        status: parse_attendance_status(&row.get::<_, String>(2)?),
        check_in: row.get(3)?,
        check_out: row.get(4)?,
    })
}

fn parse_announcement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Announcement> {
    Ok(Announcement {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        audience: row.get(3)?,
        author_id: row.get(4)?,
        published_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_role(raw: &str) -> rusqlite::Result<PersonaRole> {
    match raw {
        "employee" => Ok(PersonaRole::Employee),
        "manager" => Ok(PersonaRole::Manager),
        "hr" => Ok(PersonaRole::Hr),
        other => Err(super::invalid_data(format!("Unknown role '{}'", other))),
    }
}

fn parse_leave_status(raw: &str) -> LeaveStatus {
    match raw {
        "approved" => LeaveStatus::Approved,
        "rejected" => LeaveStatus::Rejected,
        _ => LeaveStatus::Pending,
    }
}

fn parse_attendance_status(raw: &str) -> AttendanceStatus {
    match raw {
        "remote" => AttendanceStatus::Remote,
        "absent" => AttendanceStatus::Absent,
        "on-leave" => AttendanceStatus::OnLeave,
        _ => AttendanceStatus::Present,
    }
}
