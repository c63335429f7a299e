//! Batch planner: group fields into contiguous read windows.

use crate::schema::{FieldSchema, RegisterKind};

/// A contiguous address range read in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadWindow<'a> {
    pub kind: RegisterKind,
    pub start: u16,
    /// Last address covered, inclusive.
    pub end: u16,
    /// Fields fully inside the window, in address order.
    pub fields: Vec<&'a FieldSchema>,
}

impl ReadWindow<'_> {
    /// Number of addresses to request.
    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Offset of a field's first value within the returned data.
    pub fn offset_of(&self, field: &FieldSchema) -> usize {
        (field.address - self.start) as usize
    }
}

/// Plan windows for a set of fields using each kind's protocol limit.
pub fn plan<'a, I>(fields: I) -> Vec<ReadWindow<'a>>
where
    I: IntoIterator<Item = &'a FieldSchema>,
{
    plan_with(fields, RegisterKind::window_limit)
}

/// Plan windows with one fixed limit for every register kind.
pub fn plan_windows<'a, I>(fields: I, limit: u16) -> Vec<ReadWindow<'a>>
where
    I: IntoIterator<Item = &'a FieldSchema>,
{
    plan_with(fields, |_| limit)
}

fn plan_with<'a, I>(fields: I, limit: impl Fn(&RegisterKind) -> u16) -> Vec<ReadWindow<'a>>
where
    I: IntoIterator<Item = &'a FieldSchema>,
{
    // Kinds in order of first appearance.
    let mut groups: Vec<(RegisterKind, Vec<&'a FieldSchema>)> = Vec::new();
    for field in fields {
        match groups.iter_mut().find(|(kind, _)| *kind == field.kind) {
            Some((_, group)) => group.push(field),
            None => groups.push((field.kind, vec![field])),
        }
    }

    let mut windows = Vec::new();
    for (kind, mut group) in groups {
        group.sort_by_key(|f| f.address);
        plan_kind(kind, &group, limit(&kind) as u32, &mut windows);
    }
    windows
}

/// Greedy left-to-right pass over fields of one kind, sorted by address.
fn plan_kind<'a>(kind: RegisterKind, fields: &[&'a FieldSchema], limit: u32, out: &mut Vec<ReadWindow<'a>>) {
    let mut current: Option<(u32, u32, Vec<&'a FieldSchema>)> = None;

    for &field in fields {
        let start = field.address as u32;
        let end = field.end_address();

        current = match current.take() {
            None => Some((start, end, vec![field])),
            Some((window_start, window_end, mut members)) => {
                if end - window_start + 1 > limit {
                    out.push(window(kind, window_start, window_end, members));
                    Some((start, end, vec![field]))
                } else {
                    members.push(field);
                    Some((window_start, window_end.max(end), members))
                }
            }
        };
    }

    if let Some((start, end, members)) = current {
        out.push(window(kind, start, end, members));
    }
}

fn window(kind: RegisterKind, start: u32, end: u32, fields: Vec<&FieldSchema>) -> ReadWindow<'_> {
    // Validated fields never end past 0xFFFF.
    ReadWindow {
        kind,
        start: start as u16,
        end: end.min(u16::MAX as u32) as u16,
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;

    fn field(address: u16, kind: RegisterKind, data_type: DataType) -> FieldSchema {
        FieldSchema::new(address, kind, format!("f{}", address), data_type)
    }

    fn ranges(windows: &[ReadWindow<'_>]) -> Vec<(u16, u16)> {
        windows.iter().map(|w| (w.start, w.end)).collect()
    }

    #[test]
    fn test_gap_splits_window() {
        let fields: Vec<_> = [0, 1, 2, 150]
            .into_iter()
            .map(|a| field(a, RegisterKind::Holding, DataType::U16))
            .collect();

        let windows = plan_windows(&fields, 100);
        assert_eq!(ranges(&windows), vec![(0, 2), (150, 150)]);
        assert_eq!(windows[0].fields.len(), 3);
        assert_eq!(windows[0].count(), 3);
        assert_eq!(windows[1].fields[0].address, 150);
    }

    #[test]
    fn test_overlapping_fields_share_window() {
        let fields: Vec<_> = (0..3)
            .map(|i| FieldSchema::new(5, RegisterKind::Input, format!("dup{}", i), DataType::U16))
            .collect();

        let windows = plan(&fields);
        assert_eq!(ranges(&windows), vec![(5, 5)]);
        assert_eq!(windows[0].fields.len(), 3);
    }

    #[test]
    fn test_kinds_never_share_window() {
        let fields = vec![
            field(0, RegisterKind::Input, DataType::U16),
            field(0, RegisterKind::Holding, DataType::U16),
            field(1, RegisterKind::Input, DataType::U16),
            field(4, RegisterKind::Coil, DataType::Bool),
        ];

        let windows = plan(&fields);
        let kinds: Vec<_> = windows.iter().map(|w| (w.kind, w.start, w.end)).collect();
        assert_eq!(
            kinds,
            vec![
                (RegisterKind::Input, 0, 1),
                (RegisterKind::Holding, 0, 0),
                (RegisterKind::Coil, 4, 4),
            ]
        );
    }

    #[test]
    fn test_unsorted_input_and_wide_fields() {
        let fields = vec![
            field(99, RegisterKind::Holding, DataType::U32),
            field(0, RegisterKind::Holding, DataType::U32),
        ];

        // 99..=100 would make the window 101 long.
        let windows = plan(&fields);
        assert_eq!(ranges(&windows), vec![(0, 1), (99, 100)]);
        assert_eq!(windows[1].offset_of(windows[1].fields[0]), 0);
    }

    #[test]
    fn test_window_limit_is_inclusive() {
        let fields = vec![
            field(0, RegisterKind::Input, DataType::U16),
            field(99, RegisterKind::Input, DataType::U16),
        ];
        assert_eq!(ranges(&plan(&fields)), vec![(0, 99)]);
    }

    #[test]
    fn test_bit_kinds_use_larger_limit() {
        let fields = vec![
            field(0, RegisterKind::Discrete, DataType::Bool),
            field(1899, RegisterKind::Discrete, DataType::Bool),
            field(1900, RegisterKind::Discrete, DataType::Bool),
        ];
        assert_eq!(ranges(&plan(&fields)), vec![(0, 1899), (1900, 1900)]);
    }

    #[test]
    fn test_oversized_field_gets_own_window() {
        let fields = vec![
            field(0, RegisterKind::Holding, DataType::U16),
            field(1, RegisterKind::Holding, DataType::U32),
            field(3, RegisterKind::Holding, DataType::U16),
        ];

        let windows = plan_windows(&fields, 1);
        assert_eq!(ranges(&windows), vec![(0, 0), (1, 2), (3, 3)]);
    }

    #[test]
    fn test_empty_input() {
        assert!(plan(&Vec::<FieldSchema>::new()).is_empty());
    }
}
