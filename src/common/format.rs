// 显示格式化工具

/// 字节数格式化（十进制单位）
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// 速度格式化
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// 剩余时间格式化
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--".to_string();
    }
    let total = seconds.round() as u64;
    if total < 60 {
        format!("{}秒", total)
    } else if total < 3600 {
        format!("{}分{}秒", total / 60, total % 60)
    } else {
        format!("{}小时{}分", total / 3600, (total % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1500), "1.5 KB");
        assert_eq!(format_bytes(2_500_000), "2.5 MB");
        assert_eq!(format_bytes(3_200_000_000), "3.2 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1_500_000.0), "1.5 MB/s");
        assert_eq!(format_speed(-5.0), "0 B/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(42.0), "42秒");
        assert_eq!(format_eta(125.0), "2分5秒");
        assert_eq!(format_eta(7260.0), "2小时1分");
        assert_eq!(format_eta(f64::NAN), "--");
    }
}
