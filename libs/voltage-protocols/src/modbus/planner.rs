//! Read planning: merge pollable points into as few requests as possible
//!
//! Points are grouped by (slave, function code), sorted by address and
//! greedily merged while the request stays within the burst limit and the
//! configured gap. Overlapping points share a single range.

use std::collections::BTreeMap;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::DataPointConfig;

use super::codec::register_span;
use super::constants::{is_bit_function, is_read_function};
use super::types::ModbusBatchConfig;

/// One planned read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub slave_id: u8,
    pub function_code: u8,
    pub start: u16,
    pub quantity: u16,
    /// Points served by this range, in address order
    pub point_ids: Vec<u32>,
}

impl AddressRange {
    /// One past the last address covered
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.quantity)
    }

    pub fn contains(&self, address: u16, span: u16) -> bool {
        address >= self.start && u32::from(address) + u32::from(span) <= self.end()
    }
}

struct Candidate {
    address: u16,
    span: u16,
    point_id: u32,
}

/// Build read ranges for the enabled telemetry/signal points in `points`
///
/// Fails with a configuration error when a point has no Modbus mapping, is
/// mapped to a non-read function, or does not fit into a single request.
pub fn plan_reads<'a>(
    points: impl IntoIterator<Item = &'a DataPointConfig>,
    batch: &ModbusBatchConfig,
) -> Result<Vec<AddressRange>> {
    let mut groups: BTreeMap<(u8, u8), Vec<Candidate>> = BTreeMap::new();

    for point in points {
        let mapping = point.modbus().ok_or_else(|| {
            ComLinkError::config(format!("point {} has no Modbus mapping", point.id))
        })?;
        if !is_read_function(mapping.function_code) {
            return Err(ComLinkError::config(format!(
                "point {} is polled but mapped to FC{:02}",
                point.id, mapping.function_code
            )));
        }
        let span = register_span(point, mapping);
        if u32::from(mapping.register_address) + u32::from(span) > u32::from(u16::MAX) + 1 {
            return Err(ComLinkError::config(format!(
                "point {} at address {} overruns the address space",
                point.id, mapping.register_address
            )));
        }
        groups
            .entry((mapping.slave_id, mapping.function_code))
            .or_default()
            .push(Candidate {
                address: mapping.register_address,
                span,
                point_id: point.id,
            });
    }

    let mut ranges = Vec::new();
    for ((slave_id, function_code), mut candidates) in groups {
        candidates.sort_by_key(|c| (c.address, c.point_id));

        let burst = if is_bit_function(function_code) {
            batch.max_bit_batch_size
        } else {
            batch.register_limit(slave_id)
        };

        let mut current: Option<AddressRange> = None;
        for candidate in candidates {
            if candidate.span > burst {
                return Err(ComLinkError::config(format!(
                    "point {} spans {} registers, more than the {} allowed per request",
                    candidate.point_id, candidate.span, burst
                )));
            }
            let candidate_end = u32::from(candidate.address) + u32::from(candidate.span);

            if let Some(range) = current.as_mut() {
                let new_end = range.end().max(candidate_end);
                let gap = u32::from(candidate.address).saturating_sub(range.end());
                let fits = new_end - u32::from(range.start) <= u32::from(burst);
                let close_enough = match batch.max_gap {
                    Some(max_gap) => gap <= u32::from(max_gap),
                    None => true,
                };
                if batch.enabled && fits && close_enough {
                    range.quantity = (new_end - u32::from(range.start)) as u16;
                    range.point_ids.push(candidate.point_id);
                    continue;
                }
            }

            if let Some(done) = current.take() {
                ranges.push(done);
            }
            current = Some(AddressRange {
                slave_id,
                function_code,
                start: candidate.address,
                quantity: candidate.span,
                point_ids: vec![candidate.point_id],
            });
        }
        if let Some(done) = current {
            ranges.push(done);
        }
    }

    Ok(ranges)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::modbus::constants::*;
    use crate::modbus::types::DeviceLimit;
    use voltage_comlink::{DataType, PointType};

    fn point(id: u32, slave: u8, fc: u8, address: u16, data_type: DataType) -> DataPointConfig {
        DataPointConfig::new(id, format!("p{id}"), PointType::Telemetry, data_type)
            .with_modbus(slave, fc, address)
    }

    fn assert_covers(ranges: &[AddressRange], points: &[DataPointConfig], burst: u16) {
        for p in points {
            let mapping = p.modbus().unwrap();
            let span = register_span(p, mapping);
            let covering = ranges
                .iter()
                .filter(|r| {
                    r.slave_id == mapping.slave_id
                        && r.function_code == mapping.function_code
                        && r.point_ids.contains(&p.id)
                })
                .collect::<Vec<_>>();
            assert_eq!(covering.len(), 1, "point {} must be in exactly one range", p.id);
            assert!(covering[0].contains(mapping.register_address, span));
        }
        for r in ranges {
            assert!(r.quantity <= burst);
        }
    }

    #[test]
    fn test_contiguous_points_merge() {
        let points = vec![
            point(1, 1, FC_READ_HOLDING_REGISTERS, 100, DataType::Uint16),
            point(2, 1, FC_READ_HOLDING_REGISTERS, 101, DataType::Float32),
            point(3, 1, FC_READ_HOLDING_REGISTERS, 103, DataType::Int16),
        ];
        let ranges = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[0].quantity, 4);
        assert_eq!(ranges[0].point_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_groups_never_mix_slaves_or_functions() {
        let points = vec![
            point(1, 1, FC_READ_HOLDING_REGISTERS, 0, DataType::Uint16),
            point(2, 2, FC_READ_HOLDING_REGISTERS, 1, DataType::Uint16),
            point(3, 1, FC_READ_INPUT_REGISTERS, 2, DataType::Uint16),
            point(4, 1, FC_READ_COILS, 3, DataType::Bool),
        ];
        let ranges = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(ranges.len(), 4);
        assert_covers(&ranges, &points, 125);
    }

    #[test]
    fn test_burst_limit_splits() {
        let points: Vec<_> = (0..130u16)
            .map(|i| point(u32::from(i), 1, FC_READ_HOLDING_REGISTERS, i, DataType::Uint16))
            .collect();
        let ranges = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].quantity, 125);
        assert_eq!(ranges[1].start, 125);
        assert_eq!(ranges[1].quantity, 5);
        assert_covers(&ranges, &points, 125);
    }

    #[test]
    fn test_max_gap_splits() {
        let points = vec![
            point(1, 1, FC_READ_HOLDING_REGISTERS, 0, DataType::Uint16),
            point(2, 1, FC_READ_HOLDING_REGISTERS, 10, DataType::Uint16),
        ];
        let unbounded = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(unbounded.len(), 1);
        assert_eq!(unbounded[0].quantity, 11);

        let batch = ModbusBatchConfig {
            max_gap: Some(5),
            ..Default::default()
        };
        let split = plan_reads(&points, &batch).unwrap();
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn test_overlapping_points_share_range() {
        let mut a = point(1, 1, FC_READ_HOLDING_REGISTERS, 50, DataType::Bool);
        a.point_type = PointType::Signal;
        a.modbus_mut().unwrap().bit_position = Some(0);
        let mut b = a.clone();
        b.id = 2;
        b.modbus_mut().unwrap().bit_position = Some(1);
        let c = point(3, 1, FC_READ_HOLDING_REGISTERS, 50, DataType::Uint32);

        let points = vec![a, b, c];
        let ranges = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].quantity, 2);
        assert_eq!(ranges[0].point_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_device_limit_applies_per_slave() {
        let mut batch = ModbusBatchConfig::default();
        batch.device_limits.insert(
            2,
            DeviceLimit {
                max_registers_per_read: 10,
                description: None,
            },
        );
        let points: Vec<_> = (0..20u16)
            .flat_map(|i| {
                [
                    point(u32::from(i), 1, FC_READ_HOLDING_REGISTERS, i, DataType::Uint16),
                    point(100 + u32::from(i), 2, FC_READ_HOLDING_REGISTERS, i, DataType::Uint16),
                ]
            })
            .collect();
        let ranges = plan_reads(&points, &batch).unwrap();
        let slave1: Vec<_> = ranges.iter().filter(|r| r.slave_id == 1).collect();
        let slave2: Vec<_> = ranges.iter().filter(|r| r.slave_id == 2).collect();
        assert_eq!(slave1.len(), 1);
        assert_eq!(slave2.len(), 2);
        assert!(slave2.iter().all(|r| r.quantity <= 10));
    }

    #[test]
    fn test_bits_use_bit_burst() {
        let points: Vec<_> = (0..2001u16)
            .map(|i| {
                let mut p = point(u32::from(i), 1, FC_READ_COILS, i, DataType::Bool);
                p.point_type = PointType::Signal;
                p
            })
            .collect();
        let ranges = plan_reads(&points, &ModbusBatchConfig::default()).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].quantity, 2000);
        assert_covers(&ranges, &points, 2000);
    }

    #[test]
    fn test_disabled_batching_reads_points_individually() {
        let points = vec![
            point(1, 1, FC_READ_HOLDING_REGISTERS, 0, DataType::Uint16),
            point(2, 1, FC_READ_HOLDING_REGISTERS, 1, DataType::Uint16),
        ];
        let batch = ModbusBatchConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(plan_reads(&points, &batch).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_points_are_config_errors() {
        let oversized = point(1, 1, FC_READ_HOLDING_REGISTERS, 0, DataType::Uint16);
        let mut oversized = oversized;
        oversized.modbus_mut().unwrap().register_count = Some(126);
        assert!(matches!(
            plan_reads([&oversized], &ModbusBatchConfig::default()),
            Err(ComLinkError::Config(_))
        ));

        let write_fc = point(2, 1, FC_WRITE_SINGLE_REGISTER, 0, DataType::Uint16);
        assert!(plan_reads([&write_fc], &ModbusBatchConfig::default()).is_err());

        let unmapped = DataPointConfig::new(3, "x", PointType::Telemetry, DataType::Uint16);
        assert!(plan_reads([&unmapped], &ModbusBatchConfig::default()).is_err());
    }
}
