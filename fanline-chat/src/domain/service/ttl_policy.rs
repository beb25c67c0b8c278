//! 房间存活时长计算
//!
//! 纯函数组件，不做任何 I/O。所有计算都在同一个规范时区中进行，避免不同实例之间出现跨日偏差。
//! 计算结果低于下限时取下限；结果非法（零、负数或输入无法解析）时使用固定兜底时长并记录日志。

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::domain::model::RoomType;

pub const DEFAULT_TIMEZONE: &str = "Asia/Seoul";

#[derive(Debug, Clone)]
pub struct RoomTtlPolicy {
    tz: Tz,
    minimum: Duration,
    fallback: Duration,
    lounge: Duration,
}

impl RoomTtlPolicy {
    pub fn new(tz: Tz, minimum: Duration, fallback: Duration, lounge: Duration) -> Self {
        Self {
            tz,
            minimum,
            fallback,
            lounge,
        }
    }

    /// 按时区名称构造，例如 `Asia/Seoul`
    pub fn with_timezone_name(
        name: &str,
        minimum: Duration,
        fallback: Duration,
        lounge: Duration,
    ) -> Result<Self, String> {
        let tz: Tz = name
            .parse()
            .map_err(|err| format!("unknown timezone {}: {}", name, err))?;
        Ok(Self::new(tz, minimum, fallback, lounge))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn minimum(&self) -> Duration {
        self.minimum
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }

    /// 距离下一个本地午夜的时长
    pub fn until_next_midnight(&self, now: DateTime<Utc>) -> Duration {
        let local = now.with_timezone(&self.tz);
        let next_midnight = local
            .date_naive()
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .and_then(|naive| self.tz.from_local_datetime(&naive).earliest());

        match next_midnight {
            Some(midnight) => self.clamp(midnight.with_timezone(&Utc) - now, "next_midnight"),
            None => {
                warn!(%now, tz = %self.tz, "cannot resolve next local midnight, using fallback ttl");
                self.fallback
            }
        }
    }

    /// 距离事件时间 + 1 天的时长
    pub fn until_day_after(&self, event: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        self.clamp(event + ChronoDuration::days(1) - now, "day_after_event")
    }

    /// 解析事件时间字符串后计算 [`Self::until_day_after`]
    ///
    /// 接受 RFC 3339 时间，或不带时区的 `YYYY-MM-DDTHH:MM[:SS]` / `YYYY-MM-DD HH:MM[:SS]`
    /// （按规范时区解释）。
    pub fn until_day_after_str(&self, raw: &str, now: DateTime<Utc>) -> Duration {
        match self.parse_event_time(raw) {
            Some(event) => self.until_day_after(event, now),
            None => {
                warn!(raw, "unparseable event time, using fallback ttl");
                self.fallback
            }
        }
    }

    /// 按房间类型计算存活时长
    pub fn for_room(
        &self,
        room_type: RoomType,
        event_time: Option<&str>,
        now: DateTime<Utc>,
    ) -> Duration {
        match room_type {
            RoomType::Game => match event_time {
                Some(raw) => self.until_day_after_str(raw, now),
                None => {
                    warn!("game room without event time, using fallback ttl");
                    self.fallback
                }
            },
            RoomType::Matching => self.until_next_midnight(now),
            RoomType::Lounge => self.lounge.max(self.minimum),
        }
    }

    /// 规范时区下的日期键（`yyyymmdd`）
    pub fn date_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.tz).format("%Y%m%d").to_string()
    }

    pub fn parse_event_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        const NAIVE_FORMATS: [&str; 4] = [
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%dT%H:%M",
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%d %H:%M",
        ];
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .and_then(|naive| self.tz.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
    }

    fn clamp(&self, computed: ChronoDuration, kind: &'static str) -> Duration {
        if computed <= ChronoDuration::zero() {
            warn!(
                kind,
                computed_ms = computed.num_milliseconds(),
                "non-positive ttl computed, using fallback ttl"
            );
            return self.fallback;
        }
        match computed.to_std() {
            Ok(ttl) => ttl.max(self.minimum),
            Err(_) => self.fallback,
        }
    }
}

impl Default for RoomTtlPolicy {
    fn default() -> Self {
        Self::new(
            chrono_tz::Asia::Seoul,
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::from_secs(6 * 3600),
        )
    }
}
