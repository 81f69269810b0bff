//! Z-order clustering.
//!
//! Interleaves the bit representations of the chosen columns' normalized values (or applies
//! a Hilbert transform first), sorts the table by the resulting key and rewrites files so
//! each holds one contiguous key range. The payoff is zone-map selectivity for subsequent
//! multi-column range queries; the row multiset is unchanged.

use strum::{Display as StrumDisplay, EnumString};

use crate::actions::{Action, Remove};
use crate::error::{DeltaResult, Error};
use crate::maintenance::group_by_partition_values;
use crate::row::{resolve_path, Row, Value};
use crate::table::MaintenanceContext;
use crate::utils::{current_time_millis, require};
use crate::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
pub enum CurveType {
    #[default]
    ZOrder,
    Hilbert,
}

#[derive(Debug, Clone)]
pub struct ZOrderOptions {
    pub columns: Vec<String>,
    pub curve: CurveType,
    pub target_rows_per_file: usize,
    pub dry_run: bool,
}

impl Default for ZOrderOptions {
    fn default() -> Self {
        ZOrderOptions {
            columns: Vec::new(),
            curve: CurveType::default(),
            target_rows_per_file: 100_000,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZOrderResult {
    pub version: Option<Version>,
    pub rows_clustered: u64,
    pub files_before: usize,
    pub files_after: usize,
}

/// Normalize one column's value into u32 key space. Numbers and timestamps scale linearly
/// over the observed range; strings use their first four bytes; everything else (and null)
/// maps to zero.
fn normalize(value: Option<&Value>, min: f64, max: f64) -> u32 {
    match value {
        Some(Value::Str(s)) => {
            let mut buf = [0u8; 4];
            for (i, b) in s.bytes().take(4).enumerate() {
                buf[i] = b;
            }
            u32::from_be_bytes(buf)
        }
        Some(v) => match numeric(v) {
            Some(n) if max > min => {
                (((n - min) / (max - min)).clamp(0.0, 1.0) * u32::MAX as f64) as u32
            }
            Some(_) => 0,
            None => 0,
        },
        None => 0,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::I32(v) => Some(*v as f64),
        Value::I64(v) => Some(*v as f64),
        Value::F64(v) => Some(*v),
        Value::Ts(v) => Some(*v as f64),
        Value::Bool(b) => Some(*b as i32 as f64),
        _ => None,
    }
}

/// Bit-interleave the coordinates, most significant bits first. The result orders
/// lexicographically like the Morton index.
fn interleave(coords: &[u32]) -> u128 {
    let dims = coords.len().max(1);
    let bits_per_dim = (128 / dims).min(32) as u32;
    let mut key: u128 = 0;
    for bit in (0..bits_per_dim).rev() {
        for coord in coords {
            // take from the high end so coarse ordering dominates
            let b = (coord >> (32 - bits_per_dim + bit)) & 1;
            key = (key << 1) | b as u128;
        }
    }
    key
}

/// Skilling's axes-to-transpose: converts coordinates in place so that bit-interleaving the
/// result yields the Hilbert curve index.
fn hilbert_transpose(coords: &mut [u32]) {
    let n = coords.len();
    if n < 2 {
        return;
    }
    let bits = 32u32;
    let mut m = 1u32 << (bits - 1);
    // inverse undo
    while m > 1 {
        let mask = m - 1;
        for i in 0..n {
            if coords[i] & m != 0 {
                coords[0] ^= mask; // invert
            } else {
                let t = (coords[0] ^ coords[i]) & mask;
                coords[0] ^= t;
                coords[i] ^= t;
            }
        }
        m >>= 1;
    }
    // gray encode
    for i in 1..n {
        coords[i] ^= coords[i - 1];
    }
    let mut t = 0u32;
    let mut q = 1u32 << (bits - 1);
    while q > 1 {
        if coords[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for coord in coords.iter_mut() {
        *coord ^= t;
    }
}

fn cluster_key(row: &Row, columns: &[String], ranges: &[(f64, f64)], curve: CurveType) -> u128 {
    let mut coords: Vec<u32> = columns
        .iter()
        .zip(ranges)
        .map(|(col, (min, max))| normalize(resolve_path(row, col), *min, *max))
        .collect();
    if curve == CurveType::Hilbert {
        hilbert_transpose(&mut coords);
    }
    interleave(&coords)
}

pub async fn zorder(ctx: &MaintenanceContext, opts: ZOrderOptions) -> DeltaResult<ZOrderResult> {
    require!(
        !opts.columns.is_empty(),
        Error::validation("z-order clustering needs at least one column")
    );
    require!(
        opts.target_rows_per_file > 0,
        Error::validation("target rows per file must be positive")
    );

    let snapshot = ctx.snapshot(None).await?;
    let Some(schema) = snapshot.schema()? else {
        return Ok(ZOrderResult::default());
    };
    let partition_columns = snapshot.properties().partition_columns;

    let mut result = ZOrderResult {
        files_before: snapshot.file_count(),
        ..Default::default()
    };

    let mut actions: Vec<Action> = Vec::new();
    let mut rewrite_counter = 0usize;
    for partition_files in group_by_partition_values(snapshot.files().cloned().collect()) {
        let mut rows: Vec<Row> = Vec::new();
        for add in &partition_files {
            rows.extend(ctx.read_file(add).await?);
        }
        if rows.is_empty() {
            continue;
        }
        result.rows_clustered += rows.len() as u64;

        // observed ranges drive the normalization
        let ranges: Vec<(f64, f64)> = opts
            .columns
            .iter()
            .map(|col| {
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for row in &rows {
                    if let Some(n) = resolve_path(row, col).and_then(numeric) {
                        min = min.min(n);
                        max = max.max(n);
                    }
                }
                if min.is_finite() {
                    (min, max)
                } else {
                    (0.0, 0.0)
                }
            })
            .collect();

        let mut keyed: Vec<(u128, Row)> = rows
            .into_iter()
            .map(|row| (cluster_key(&row, &opts.columns, &ranges, opts.curve), row))
            .collect();
        keyed.sort_by_key(|(key, _)| *key);

        let values = crate::maintenance::typed_partition_values(
            &partition_files[0],
            &partition_columns,
            &schema,
        );
        let chunks: Vec<Vec<Row>> = keyed
            .chunks(opts.target_rows_per_file)
            .map(|chunk| chunk.iter().map(|(_, row)| row.clone()).collect())
            .collect();
        result.files_after += chunks.len();
        if opts.dry_run {
            continue;
        }

        for add in &partition_files {
            ctx.uncache_file(&add.path).await;
            actions.push(Action::Remove(Remove::for_add(
                add,
                current_time_millis(),
                false,
            )));
        }
        for chunk in chunks {
            let new_add = crate::table::write::write_data_file(
                &ctx.table().inner,
                &schema,
                &partition_columns,
                &values,
                chunk,
                rewrite_counter,
                None,
            )
            .await?;
            rewrite_counter += 1;
            actions.push(Action::Add(crate::actions::Add {
                data_change: false,
                ..new_add
            }));
        }
    }

    if opts.dry_run || actions.is_empty() {
        result.version = snapshot.version();
        return Ok(result);
    }
    result.version = Some(ctx.commit("ZORDER BY", actions).await?);
    Ok(result)
}
