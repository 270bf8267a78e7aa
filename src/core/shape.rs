//! Dim-list helpers for shape derivation. Tensors carry their dims as a
//! plain `Vec<usize>`; these cover the permutation and attribute-parsing
//! steps the operators build shapes with.

use anyhow::{anyhow, Result};

/// Reorder `dims` by `perm`. An empty permutation is identity.
pub fn permute(dims: &[usize], perm: &[usize]) -> Vec<usize> {
    if perm.is_empty() {
        return dims.to_vec();
    }
    perm.iter().map(|&p| dims[p]).collect()
}

/// Parse a comma-separated permutation attribute like "0,2,1,3".
pub fn parse_perm(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(|t| {
            t.trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("bad permutation entry '{}'", t))
        })
        .collect()
}

/// Parse a comma-separated signed dim list attribute like "-1,256".
pub fn parse_dims(s: &str) -> Result<Vec<i64>> {
    s.split(',')
        .map(|t| {
            t.trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("bad dim entry '{}'", t))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute() {
        assert_eq!(permute(&[2, 8, 4, 16], &[0, 2, 1, 3]), vec![2, 4, 8, 16]);
        assert_eq!(permute(&[2, 8], &[]), vec![2, 8]);
    }

    #[test]
    fn test_parse_perm() {
        assert_eq!(parse_perm("0,2,1,3").unwrap(), vec![0, 2, 1, 3]);
        assert!(parse_perm("0,x").is_err());
    }

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims("-1,256").unwrap(), vec![-1, 256]);
        assert!(parse_dims("1,,2").is_err());
    }
}
