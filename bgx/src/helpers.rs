pub(crate) trait SliceExt {
    fn trim(&self, whitespaces: &[u8]) -> &Self;
    fn trim_start(&self, whitespaces: &[u8]) -> &Self;
    fn find(&self, needle: &[u8]) -> Option<usize>;
}

impl SliceExt for [u8] {
    fn trim(&self, whitespaces: &[u8]) -> &[u8] {
        let is_not_whitespace = |c| !whitespaces.contains(c);

        match (
            self.iter().position(is_not_whitespace),
            self.iter().rposition(is_not_whitespace),
        ) {
            (Some(first), Some(last)) => &self[first..=last],
            _ => &[],
        }
    }

    fn trim_start(&self, whitespaces: &[u8]) -> &[u8] {
        let is_not_whitespace = |c| !whitespaces.contains(c);
        self.iter()
            .position(is_not_whitespace)
            .map_or(&[], |first| &self[first..])
    }

    fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.windows(needle.len()).position(|window| window == needle)
    }
}

/// Lenient leading-integer conversion: skips whitespace and quotes, accepts an
/// optional sign and a `0x` prefix, stops at the first non digit.
pub(crate) fn parse_int(token: &[u8]) -> Option<i32> {
    let token = token.trim_start(b" \t\"");
    let (negative, token) = match token.first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };
    let (radix, digits) = match token {
        [b'0', b'x' | b'X', rest @ ..] => (16, rest),
        _ => (10, token),
    };

    let mut value: i64 = 0;
    let mut seen = false;
    for &c in digits {
        let Some(d) = (c as char).to_digit(radix) else {
            break;
        };
        seen = true;
        value = value * radix as i64 + d as i64;
        if value > i32::MAX as i64 + 1 {
            return None;
        }
    }
    if !seen {
        return None;
    }
    let value = if negative { -value } else { value };
    i32::try_from(value).ok()
}

/// Copy `src` into a heapless string, truncating on a char boundary.
pub(crate) fn copy_str<const N: usize>(dst: &mut heapless::String<N>, src: &str) {
    dst.clear();
    for c in src.chars() {
        if dst.push(c).is_err() {
            break;
        }
    }
}

pub struct LossyStr<'a>(pub &'a [u8]);

impl<'a> core::fmt::Debug for LossyStr<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match core::str::from_utf8(self.0) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

#[cfg(feature = "defmt")]
impl<'a> defmt::Format for LossyStr<'a> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=[u8]:a}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trims_line_endings() {
        assert_eq!(b"\r\nOK\r\n".trim(b"\r\n"), b"OK");
        assert_eq!(b"\r\n\r\n".trim(b"\r\n"), b"");
        assert_eq!(b"  +QIRD: 5".trim_start(b" "), b"+QIRD: 5");
    }

    #[test]
    fn leading_integers() {
        assert_eq!(parse_int(b"17,\"topic\""), Some(17));
        assert_eq!(parse_int(b" -1"), Some(-1));
        assert_eq!(parse_int(b"\"3\""), Some(3));
        assert_eq!(parse_int(b"0x1F"), Some(31));
        assert_eq!(parse_int(b"abc"), None);
        assert_eq!(parse_int(b""), None);
    }

    #[test]
    fn find_needle() {
        assert_eq!(b"\r\nSEND OK\r\n".find(b"SEND OK"), Some(2));
        assert_eq!(b"OK".find(b"ERROR"), None);
    }
}
