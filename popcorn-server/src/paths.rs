//! Client-path translation
//!
//! Incoming paths are absolute paths on the client machine. Before they are
//! materialized under a session working directory two translations apply:
//!
//! 1. With the object cache enabled, the client's username segment is
//!    neutralized so that identical projects under different accounts map
//!    to identical session trees (and therefore identical object keys).
//! 2. The leading separator is stripped to nest the path inside the
//!    session directory.
//!
//! Include directories in compiler argv get the same treatment plus a
//!    reachability check: a directory nothing was staged under is dropped
//! together with its flag, so the compiler never scans absent trees.

use std::path::PathBuf;

/// Replacement for the client's username segment in incoming paths
pub const SERVER_USER: &str = "popcorn-server-user";

/// Include flags whose following argument names a directory
const INCLUDE_DIR_FLAGS: [&str; 3] = ["-I", "-iquote", "-isystem"];

/// Rewrite every `/<user_name>/` segment to `/popcorn-server-user/`
pub fn neutralize_user_prefix(path: &str, user_name: &str) -> String {
    if user_name.is_empty() {
        return path.to_string();
    }
    path.replace(
        &format!("/{user_name}/"),
        &format!("/{SERVER_USER}/"),
    )
}

/// Strip the leading separator so the path nests under a session directory
pub fn session_relative(path: &str) -> PathBuf {
    PathBuf::from(path.trim_start_matches('/'))
}

/// Translate one client path for a session: username neutralization (when
/// the object cache is on) without the leading separator
pub fn translate(path: &str, user_name: &str, neutralize: bool) -> String {
    if neutralize {
        neutralize_user_prefix(path, user_name)
    } else {
        path.to_string()
    }
}

/// Rewrite include-directory arguments to session-relative form.
///
/// `staged` holds the translated absolute client paths of every file that
/// was actually materialized in the session. An include directory that no
/// staged file lies under is dropped together with its flag. Matching
/// appends a separator first, so `/foo` cannot claim files under `/foobar`.
pub fn rewrite_include_dirs(
    args: &[String],
    user_name: &str,
    neutralize: bool,
    staged: &[String],
) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if INCLUDE_DIR_FLAGS.contains(&arg.as_str()) && i + 1 < args.len() {
            let translated = translate(&args[i + 1], user_name, neutralize);
            let mut prefix = translated.clone();
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            if staged.iter().any(|file| file.starts_with(&prefix)) {
                out.push(arg.clone());
                out.push(session_relative(&translated).to_string_lossy().into_owned());
            }
            i += 2;
            continue;
        }
        out.push(arg.clone());
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_user_prefix_is_neutralized_everywhere() {
        assert_eq!(
            neutralize_user_prefix("/home/alice/proj/a.h", "alice"),
            "/home/popcorn-server-user/proj/a.h"
        );
        assert_eq!(
            neutralize_user_prefix("/data/alice/out/alice/x", "alice"),
            "/data/popcorn-server-user/out/popcorn-server-user/x"
        );
        // A username appearing as a substring of a segment is untouched.
        assert_eq!(
            neutralize_user_prefix("/home/alicette/a.h", "alice"),
            "/home/alicette/a.h"
        );
    }

    #[test]
    fn test_translate_preserves_paths_without_object_cache() {
        assert_eq!(
            translate("/home/alice/proj/a.h", "alice", false),
            "/home/alice/proj/a.h"
        );
    }

    #[test]
    fn test_session_relative_strips_root() {
        assert_eq!(
            session_relative("/home/alice/a.cpp"),
            PathBuf::from("home/alice/a.cpp")
        );
    }

    #[test]
    fn test_include_dirs_become_session_relative() {
        let staged = vec!["/home/alice/proj/include/a.h".to_string()];
        let rewritten = rewrite_include_dirs(
            &args(&["-O2", "-I", "/home/alice/proj/include", "-std=c++17"]),
            "alice",
            false,
            &staged,
        );
        assert_eq!(
            rewritten,
            args(&["-O2", "-I", "home/alice/proj/include", "-std=c++17"])
        );
    }

    #[test]
    fn test_unstaged_include_dir_is_dropped_with_flag() {
        let staged = vec!["/proj/include/a.h".to_string()];
        let rewritten = rewrite_include_dirs(
            &args(&["-I", "/proj/include", "-isystem", "/usr/include", "-g"]),
            "alice",
            false,
            &staged,
        );
        assert_eq!(rewritten, args(&["-I", "proj/include", "-g"]));
    }

    #[test]
    fn test_prefix_match_needs_the_separator() {
        let staged = vec!["/foobar/a.h".to_string()];
        let rewritten = rewrite_include_dirs(&args(&["-I", "/foo"]), "", false, &staged);
        assert_eq!(rewritten, Vec::<String>::new());

        let staged = vec!["/foo/a.h".to_string()];
        let rewritten = rewrite_include_dirs(&args(&["-I", "/foo"]), "", false, &staged);
        assert_eq!(rewritten, args(&["-I", "foo"]));
    }

    #[test]
    fn test_include_rewrite_neutralizes_usernames() {
        let staged = vec!["/home/popcorn-server-user/inc/a.h".to_string()];
        let rewritten = rewrite_include_dirs(
            &args(&["-iquote", "/home/bob/inc"]),
            "bob",
            true,
            &staged,
        );
        assert_eq!(rewritten, args(&["-iquote", "home/popcorn-server-user/inc"]));
    }
}
