use crate::error::VemuError;

const DISK_UNITS: &[(char, u32)] = &[('K', 1), ('M', 2), ('G', 3), ('T', 4)];

fn disk_error(value: &str, reason: &str) -> VemuError {
    VemuError::Validation {
        message: format!("disk = \"{value}\": {reason}"),
    }
}

/// Parse the `disk` size of a VM into bytes.
///
/// Takes the suffixes `qemu-img create` takes (`K`, `M`, `G`, `T`), in
/// binary units, optionally followed by `B` or `iB`: `20G`, `512MiB` and
/// `21474836480` are all accepted.
pub fn parse_disk_size(value: &str) -> Result<u64, VemuError> {
    let trimmed = value.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);
    if digits.is_empty() {
        return Err(disk_error(value, "expected a number of bytes, optionally with a K/M/G/T suffix"));
    }

    let count: u64 = digits
        .parse()
        .map_err(|_| disk_error(value, "number is too large"))?;

    let unit = unit.trim_start().to_ascii_uppercase();
    let prefix = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(&unit);
    let shift = match prefix.chars().collect::<Vec<_>>().as_slice() {
        [] => 0,
        [c] => DISK_UNITS
            .iter()
            .find(|(suffix, _)| suffix == c)
            .map(|(_, power)| power * 10)
            .ok_or_else(|| disk_error(value, "unknown unit (use K, M, G or T)"))?,
        _ => return Err(disk_error(value, "unknown unit (use K, M, G or T)")),
    };

    count
        .checked_mul(1u64 << shift)
        .ok_or_else(|| disk_error(value, "size overflows 64 bits"))
}

/// Render an argv as a single shell-pasteable line, quoting where needed.
pub fn shell_join<I, S>(argv: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    argv.into_iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_size_units_are_binary() {
        assert_eq!(parse_disk_size("20G").unwrap(), 20 << 30);
        assert_eq!(parse_disk_size("20GiB").unwrap(), 20 << 30);
        assert_eq!(parse_disk_size("1gb").unwrap(), 1 << 30);
        assert_eq!(parse_disk_size("512M").unwrap(), 512 << 20);
        assert_eq!(parse_disk_size("2T").unwrap(), 2 << 40);
    }

    #[test]
    fn disk_size_plain_bytes() {
        assert_eq!(parse_disk_size("21474836480").unwrap(), 21474836480);
        assert_eq!(parse_disk_size(" 64 K ").unwrap(), 64 << 10);
    }

    #[test]
    fn disk_size_errors_name_the_field() {
        for bad in ["", "G", "10X", "10GG", "-5G"] {
            let err = parse_disk_size(bad).unwrap_err();
            assert!(err.to_string().contains("disk = "), "{bad}: {err}");
        }
        assert!(parse_disk_size("99999999999T").is_err());
    }

    #[test]
    fn shell_join_quotes_only_when_needed() {
        let line = shell_join(["qemu-img", "create", "-b", "/tmp/my base.img"]);
        assert_eq!(line, "qemu-img create -b '/tmp/my base.img'");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
