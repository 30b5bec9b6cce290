// 文件命名与落位
//
// 文件名清洗、冲突避让、目录保证与原子移动。
// 这里的所有函数都是同步的，只应在阻塞线程上调用

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// 清洗后文件名的最大长度（按字符计）
const MAX_NAME_LEN: usize = 180;

/// 冲突避让的顺序编号上限，超过后改用随机唯一名
const MAX_COLLISION_PROBES: u32 = 999;

/// 清洗文件名
///
/// 去除首尾空白，替换路径分隔符与控制字符为下划线，
/// 折叠连续下划线，超长截断。清洗后为空则回退到时间戳名
pub fn sanitize_file_name(raw: &str, extension_hint: Option<&str>) -> String {
    let trimmed = raw.trim();

    let mut cleaned = String::with_capacity(trimmed.len());
    let mut last_was_underscore = false;
    for ch in trimmed.chars() {
        let replaced = if ch == '/' || ch == ':' || ch == '\\' || ch.is_control() {
            '_'
        } else {
            ch
        };
        if replaced == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        cleaned.push(replaced);
    }

    if cleaned.chars().count() > MAX_NAME_LEN {
        cleaned = cleaned.chars().take(MAX_NAME_LEN).collect();
    }

    // 全下划线或空名视为无效
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_' || c == '.') {
        return fallback_name(extension_hint);
    }

    cleaned
}

/// 时间戳回退名：`download-<unix-ts>[.<ext>]`
pub fn fallback_name(extension_hint: Option<&str>) -> String {
    let ts = chrono::Utc::now().timestamp();
    match extension_hint {
        Some(ext) if !ext.is_empty() => format!("download-{}.{}", ts, ext),
        _ => format!("download-{}", ts),
    }
}

/// 从 URL 的最后一段路径推导初始文件名
///
/// 百分号编码先解码再清洗；无可用名时返回时间戳回退名
pub fn url_file_name(url: &str) -> String {
    let last_segment = url
        .split('?')
        .next()
        .unwrap_or("")
        .split('#')
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");

    let decoded = urlencoding::decode(last_segment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| last_segment.to_string());

    sanitize_file_name(&decoded, url_extension(url).as_deref())
}

/// URL 路径段的扩展名（不含点）
pub fn url_extension(url: &str) -> Option<String> {
    let last_segment = url
        .split('?')
        .next()?
        .split('#')
        .next()?
        .rsplit('/')
        .next()?;
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_string())
}

/// 确保目录存在
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// 在目录内为文件名找到不冲突的目标路径
///
/// 依次尝试 `name`、`stem (1).ext` … `stem (999).ext`，
/// 全部被占用时退回带随机后缀的唯一名
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(file_name);
    for n in 1..=MAX_COLLISION_PROBES {
        let name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let probe = dir.join(name);
        if !probe.exists() {
            return probe;
        }
    }

    let suffix = Uuid::new_v4().to_string();
    let name = match ext {
        Some(ext) => format!("{}-{}.{}", stem, suffix, ext),
        None => format!("{}-{}", stem, suffix),
    };
    dir.join(name)
}

fn split_name(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    }
}

/// 移动文件到目标路径，目标已存在时先移除
///
/// 跨文件系统时 rename 会失败，退回复制加删除
pub fn move_replacing(src: &Path, dest: &Path) -> io::Result<()> {
    if dest.exists() {
        fs::remove_file(dest)?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dest)?;
            fs::remove_file(src)?;
            Ok(())
        }
    }
}
