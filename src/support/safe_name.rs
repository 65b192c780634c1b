//-
// Copyright (c) 2020, 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

/// Determine whether the given partition name is "safe".
///
/// Partition names come from the domain part of account identifiers, which
/// are ultimately client-controlled, and become directory names under the
/// storage root. This excludes empty names and anything that could cause
/// directory traversal or hidden files.
///
/// Whether the name is ultimately a valid file name is left to the OS.
pub fn is_safe_partition_name(name: &str) -> bool {
    !name.is_empty() &&
        // Block directory traversal through .. and creation of hidden files on
        // UNIX
        !name.starts_with('.') &&
        !name.contains('/') &&
        // Only a path separator on Windows, but always block since it has high
        // potential of causing problems
        !name.contains('\\') &&
        // Don't allow any ASCII control characters
        !name.contains(|c| c < ' ' || c == '\x7F')
}

#[cfg(test)]
mod test {
    use super::is_safe_partition_name;

    #[test]
    fn test_is_safe_partition_name() {
        assert!(is_safe_partition_name("example.com"));
        assert!(is_safe_partition_name("local"));
        assert!(is_safe_partition_name("bücher.de"));
        assert!(!is_safe_partition_name(""));
        assert!(!is_safe_partition_name("."));
        assert!(!is_safe_partition_name(".."));
        assert!(!is_safe_partition_name(".hidden"));
        assert!(!is_safe_partition_name("foo/bar"));
        assert!(!is_safe_partition_name("/etc"));
        assert!(!is_safe_partition_name("foo\\bar"));
        assert!(!is_safe_partition_name("foo\0"));
        assert!(!is_safe_partition_name("fo\x7Fo"));
    }
}
