use chrono::{DateTime, FixedOffset, Utc};

/// Minute thresholds for the five new-user nudges: 30m, 2h, 1d, 3d, 7d.
pub const DEFAULT_REMINDER_SCHEDULE: [i64; 5] = [30, 120, 1440, 4320, 10080];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub support_channel_id: i64,
    pub admin_channel_id: i64,
    pub database_url: String,
    /// Bootstrap admins; users in this list get the admin role on first contact.
    pub admin_ids: Vec<i64>,
    pub working_hours: WorkingHours,
    pub sla: SlaConfig,
    pub reminders: ReminderConfig,
    /// Upper bound for a single notification send.
    pub notify_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SlaConfig {
    pub warning_minutes: i64,
    pub admin_minutes: i64,
    pub critical_minutes: i64,
    /// Threshold used by the violation report, distinct from the escalation tiers.
    pub report_minutes: i64,
    pub check_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ReminderConfig {
    pub check_interval_secs: u64,
    pub schedule_minutes: [i64; 5],
}

/// Working-hours window evaluated in a fixed UTC offset.
#[derive(Clone, Debug)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub utc_offset_hours: i32,
}

impl WorkingHours {
    /// start <= local hour < end, in the configured offset.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let offset = FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        let local = now.with_timezone(&offset);
        let hour = chrono::Timelike::hour(&local);
        self.start_hour <= hour && hour < self.end_hour
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            support_channel_id: 0,
            admin_channel_id: 0,
            database_url: String::new(),
            admin_ids: Vec::new(),
            working_hours: WorkingHours {
                start_hour: 10,
                end_hour: 22,
                utc_offset_hours: 3,
            },
            sla: SlaConfig {
                warning_minutes: 15,
                admin_minutes: 30,
                critical_minutes: 120,
                report_minutes: 30,
                check_interval_secs: 300,
            },
            reminders: ReminderConfig {
                check_interval_secs: 600,
                schedule_minutes: DEFAULT_REMINDER_SCHEDULE,
            },
            notify_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            support_channel_id: env_i64("SUPPORT_GROUP_ID", defaults.support_channel_id),
            admin_channel_id: env_i64("ADMIN_CHAT_ID", defaults.admin_channel_id),
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            admin_ids: env_id_list("ADMIN_IDS"),
            working_hours: WorkingHours {
                start_hour: env_u32("WORK_START_HOUR", defaults.working_hours.start_hour),
                end_hour: env_u32("WORK_END_HOUR", defaults.working_hours.end_hour),
                utc_offset_hours: env_i64("WORK_TZ_OFFSET_HOURS", 3) as i32,
            },
            sla: SlaConfig {
                warning_minutes: env_i64("SLA_WARNING_MINUTES", defaults.sla.warning_minutes),
                admin_minutes: env_i64("SLA_ADMIN_MINUTES", defaults.sla.admin_minutes),
                critical_minutes: env_i64("SLA_CRITICAL_MINUTES", defaults.sla.critical_minutes),
                report_minutes: env_i64("SLA_MINUTES", defaults.sla.report_minutes),
                check_interval_secs: env_u64(
                    "SLA_CHECK_INTERVAL_SECS",
                    defaults.sla.check_interval_secs,
                ),
            },
            reminders: ReminderConfig {
                check_interval_secs: env_u64(
                    "REMINDER_CHECK_INTERVAL_SECS",
                    defaults.reminders.check_interval_secs,
                ),
                schedule_minutes: env_schedule(
                    "REMINDER_SCHEDULE_MINUTES",
                    defaults.reminders.schedule_minutes,
                ),
            },
            notify_timeout_secs: env_u64("NOTIFY_TIMEOUT_SECS", defaults.notify_timeout_secs),
        }
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_id_list(name: &str) -> Vec<i64> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                None
            } else {
                part.parse().ok()
            }
        })
        .collect()
}

/// Comma-separated minute thresholds; falls back to the default schedule on
/// anything other than exactly five valid values.
fn env_schedule(name: &str, default: [i64; 5]) -> [i64; 5] {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    let parsed: Vec<i64> = raw
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    match <[i64; 5]>::try_from(parsed) {
        Ok(schedule) => schedule,
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hours(start: u32, end: u32) -> WorkingHours {
        WorkingHours {
            start_hour: start,
            end_hour: end,
            utc_offset_hours: 3,
        }
    }

    #[test]
    fn test_working_hours_window() {
        let wh = hours(10, 22);
        // 07:30 UTC = 10:30 local (+3)
        let inside = Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap();
        assert!(wh.contains(inside));
        // 19:00 UTC = 22:00 local, end is exclusive
        let at_close = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        assert!(!wh.contains(at_close));
        // 06:59 UTC = 09:59 local
        let before_open = Utc.with_ymd_and_hms(2026, 3, 2, 6, 59, 0).unwrap();
        assert!(!wh.contains(before_open));
    }

    #[test]
    fn test_default_schedule() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.reminders.schedule_minutes, [30, 120, 1440, 4320, 10080]);
        assert_eq!(cfg.sla.warning_minutes, 15);
        assert_eq!(cfg.sla.critical_minutes, 120);
    }
}
