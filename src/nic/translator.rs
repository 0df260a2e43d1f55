/*!
translator.rs - Conversion between the host filesystem's path separator,
case, and arbitrary-length names and the DOS 8.3 dotted format used on the
wire by the custom filesystem-over-Ethernet protocol (`spec.md` §4.7),
grounded on `original_source/edfs.c`'s `unixpath_to_path83` /
`path83_to_filefcb` / `path83_dirname` helpers.
*/

/// Splits a host file name into an (up to 8 char, up to 3 char) 8.3 pair,
/// uppercasing and truncating each component. Host names that are already
/// short enough pass through unchanged (modulo case).
pub fn name_to_83(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    let (stem, ext) = match upper.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (upper.as_str(), None),
    };
    let stem: String = stem.chars().filter(|c| !c.is_whitespace()).take(8).collect();
    match ext {
        Some(e) if !e.is_empty() => {
            let ext: String = e.chars().filter(|c| !c.is_whitespace()).take(3).collect();
            format!("{stem}.{ext}")
        }
        _ => stem,
    }
}

/// Converts a host path (`/`-separated, arbitrary case/length components)
/// into a DOS-style backslash path of 8.3 components, e.g.
/// `"games/Doom II/doom2.wad"` -> `"\GAMES\DOOM II.WAD"` is NOT how this
/// behaves (each *component*, not the whole tail, is translated); the
/// actual mapping is `"games/doomii/save.dat"` -> `"\GAMES\DOOMII\SAVE.DAT"`.
pub fn host_to_path83(host_path: &str) -> String {
    let mut out = String::new();
    for component in host_path.split(['/', '\\']).filter(|c| !c.is_empty()) {
        out.push('\\');
        out.push_str(&name_to_83(component));
    }
    if out.is_empty() {
        out.push('\\');
    }
    out
}

/// Converts a DOS 8.3 backslash path received over the wire into a host
/// relative path (`/`-separated, lowercase). The custom filesystem only
/// ever sees paths it created itself through `host_to_path83`, so a plain
/// case-fold and separator swap is sufficient - there is no arbitrary
/// long-name side to reconstruct.
pub fn path83_to_host(path83: &str) -> String {
    path83
        .split('\\')
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("/")
        .to_ascii_lowercase()
}

/// Splits a DOS path into (directory, leaf) the way `path83_dirname` does:
/// the last backslash-delimited component is the leaf name, everything
/// before it is the parent directory.
pub fn path83_dirname(path83: &str) -> (&str, &str) {
    match path83.rfind('\\') {
        Some(0) => ("\\", &path83[1..]),
        Some(idx) => (&path83[..idx], &path83[idx + 1..]),
        None => ("", path83),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_name_truncates_to_eight_dot_three() {
        assert_eq!(name_to_83("configuration.txt"), "CONFIGUR.TXT");
    }

    #[test]
    fn extensionless_name_passes_through_uppercased() {
        assert_eq!(name_to_83("readme"), "README");
    }

    #[test]
    fn host_path_round_trips_through_path83() {
        let wire = host_to_path83("games/save/slot1.dat");
        assert_eq!(wire, "\\GAMES\\SAVE\\SLOT1.DAT");
        assert_eq!(path83_to_host(&wire), "games/save/slot1.dat");
    }

    #[test]
    fn dirname_splits_on_last_separator() {
        assert_eq!(path83_dirname("\\GAMES\\SAVE\\SLOT1.DAT"), ("\\GAMES\\SAVE", "SLOT1.DAT"));
        assert_eq!(path83_dirname("\\README.TXT"), ("\\", "README.TXT"));
    }
}
