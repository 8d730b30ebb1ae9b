//! Planner task propagation.
//!
//! Keeps markdown checklist tasks consistent across day, week, month and
//! project notes: parse checklist lines into a stable identity, locate the
//! section a child period owns inside its parent note, merge task sets into
//! notes without losing manual edits, and run the passes that ripple an edit
//! through the hierarchy.

pub mod core {
    //! Shared vocabulary: levels, hop directions and the domain error type.

    use crate::section::SectionLabel;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- Levels ------------------------------- */

    /// Document levels. `Day < Week < Month`; `Project` sits above `Month` but
    /// has no date anchor and is reached through task references.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Level {
        Day,
        Week,
        Month,
        Project,
    }

    impl Level {
        pub const ALL: [Level; 4] = [Level::Day, Level::Week, Level::Month, Level::Project];

        pub fn name(self) -> &'static str {
            match self {
                Level::Day => "day",
                Level::Week => "week",
                Level::Month => "month",
                Level::Project => "project",
            }
        }

        /// Headings that divide a document of this level into child sections.
        /// A leading heading matching one of these is never kept as a title
        /// when new tasks are inserted.
        pub fn reserved_labels(self) -> Vec<SectionLabel> {
            match self {
                Level::Day => vec![SectionLabel::Named("day planner".into())],
                Level::Week => SectionLabel::weekdays(),
                Level::Month => (1..=5).map(SectionLabel::Week).collect(),
                Level::Project => vec![],
            }
        }

        /// Whether a hop targeting a missing document of this level creates it
        /// from its template (overridable per vault).
        pub fn creates_missing(self) -> bool {
            matches!(self, Level::Week | Level::Month)
        }
    }

    impl fmt::Display for Level {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    /// Direction of a propagation hop through the hierarchy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Direction {
        Up,
        Down,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum PlannerError {
        #[error("document {0} does not exist")]
        DocumentNotFound(String),
        #[error("no heading for section {0:?}")]
        SectionNotFound(String),
        #[error("{input:?} is not a valid {level} key")]
        InvalidPeriodKey { level: Level, input: String },
        #[error("store failure at {path}")]
        Store {
            path: String,
            #[source]
            source: std::io::Error,
        },
    }

    pub type Result<T> = std::result::Result<T, PlannerError>;
}

pub mod task {
    //! Checklist line grammar and task identity.
    //!
    //! A task line is `- [ ] text` or `- [x] text` (`[X]` is accepted on read),
    //! optionally indented. An `HH:MM` token right after the checkbox is a
    //! presentation detail and never part of identity. In project-aware
    //! contexts neither is a trailing `#Project` tag or
    //! `[Project](Projects/Project.md)` link.

    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{tag, take_until, take_while_m_n},
        character::complete::{char, one_of, space0},
        combinator::{eof, recognize},
        error::VerboseError,
        sequence::{delimited, pair, preceded, terminated, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Grammar ------------------------------ */

    fn checkbox(i: &str) -> PResult<'_, char> {
        preceded(tag("- ["), terminated(one_of(" xX"), char(']')))(i)
    }

    /// Splits a line into its indentation, checkbox state and the rest.
    fn split_marker(line: &str) -> Option<(&str, char, &str)> {
        let (rest, indent) = space0::<_, VerboseError<&str>>(line).ok()?;
        let (rest, mark) = checkbox(rest).ok()?;
        Some((indent, mark, rest))
    }

    fn time_token(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
            char(':'),
            take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
        )))(i)
    }

    fn link(i: &str) -> PResult<'_, (&str, &str)> {
        terminated(
            pair(
                delimited(char('['), take_until("]"), char(']')),
                delimited(char('('), take_until(")"), char(')')),
            ),
            eof,
        )(i)
    }

    fn rewrite_marker(line: &str, mark: char) -> String {
        match split_marker(line) {
            Some((indent, _, rest)) => format!("{indent}- [{mark}]{rest}"),
            None => line.to_string(),
        }
    }

    /// Marks a task line done. Anything without a checkbox comes back unchanged.
    pub fn tick(line: &str) -> String {
        rewrite_marker(line, 'x')
    }

    /// Marks a task line open. Anything without a checkbox comes back unchanged.
    pub fn untick(line: &str) -> String {
        rewrite_marker(line, ' ')
    }

    /// Removes an `HH:MM` token, and the whitespace after it, that directly
    /// follows the checkbox.
    pub fn strip_time_prefix(line: &str) -> String {
        let Some((indent, mark, rest)) = split_marker(line) else {
            return line.to_string();
        };
        let Some(body) = rest.strip_prefix(' ') else {
            return line.to_string();
        };
        match time_token(body) {
            Ok((after, _)) if after.is_empty() || after.starts_with(char::is_whitespace) => {
                format!("{indent}- [{mark}] {}", after.trim_start())
            }
            _ => line.to_string(),
        }
    }

    /// Text after `- [ ] `, if there is any.
    fn body(line: &str) -> Option<&str> {
        let (_, _, rest) = split_marker(line)?;
        let text = rest.strip_prefix(' ')?;
        (!text.trim().is_empty()).then_some(text)
    }

    /* --------------------------- Project references --------------------------- */

    /// Which reference form is written when tasks are read back out of a
    /// project document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ReferenceStyle {
        #[default]
        Link,
        Tag,
    }

    /// A trailing reference tying a task to a project document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub enum ProjectRef {
        /// `#Name`
        Tag(String),
        /// `[Label](Projects/Name.md)`
        Link { label: String, target: String },
    }

    impl ProjectRef {
        /// Reference written for `name` in the configured style. Names with
        /// whitespace cannot be tags and always use the link form.
        pub fn canonical(name: &str, style: ReferenceStyle, project_folder: &str) -> Self {
            match style {
                ReferenceStyle::Tag if !name.contains(char::is_whitespace) => {
                    ProjectRef::Tag(name.to_string())
                }
                _ => ProjectRef::Link {
                    label: name.to_string(),
                    target: format!("{project_folder}/{}.md", name.replace(' ', "%20")),
                },
            }
        }

        /// Project name: the tag text, or the file stem of the link target.
        pub fn project(&self) -> String {
            match self {
                ProjectRef::Tag(name) => name.clone(),
                ProjectRef::Link { target, .. } => {
                    let file = target.rsplit('/').next().unwrap_or(target);
                    file.trim_end_matches(".md").replace("%20", " ")
                }
            }
        }
    }

    impl fmt::Display for ProjectRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ProjectRef::Tag(name) => write!(f, "#{name}"),
                ProjectRef::Link { label, target } => write!(f, "[{label}]({target})"),
            }
        }
    }

    fn in_folder(target: &str, folder: &str) -> bool {
        let target = target.trim_start_matches("./");
        match target.rsplit_once('/') {
            Some((dir, file)) => dir == folder && file.len() > 3 && file.ends_with(".md"),
            None => false,
        }
    }

    fn split_ref_text<'a>(text: &'a str, project_folder: &str) -> Option<(&'a str, ProjectRef)> {
        let text = text.trim_end();
        if text.ends_with(')') {
            for (idx, _) in text.rmatch_indices(" [") {
                if let Ok((_, (label, target))) = link(&text[idx + 1..]) {
                    let target = target.trim_matches(|c| c == '<' || c == '>');
                    if !in_folder(target, project_folder) {
                        break;
                    }
                    let reference = ProjectRef::Link {
                        label: label.to_string(),
                        target: target.to_string(),
                    };
                    return Some((&text[..idx], reference));
                }
            }
        }
        let (head, last) = text.rsplit_once(char::is_whitespace)?;
        let name = last.strip_prefix('#')?;
        if name.is_empty() || name.starts_with('#') {
            return None;
        }
        Some((head, ProjectRef::Tag(name.to_string())))
    }

    /// Splits a trailing project reference off a task line. Links only count
    /// when they point into `project_folder`; the remaining text must still be
    /// a task.
    pub fn strip_project_ref(line: &str, project_folder: &str) -> Option<(String, ProjectRef)> {
        let (indent, mark, rest) = split_marker(line)?;
        let text = rest.strip_prefix(' ')?;
        let (head, reference) = split_ref_text(text, project_folder)?;
        let head = head.trim_end();
        if head.trim().is_empty() {
            return None;
        }
        Some((format!("{indent}- [{mark}] {head}"), reference))
    }

    /* -------------------------------- Tasks -------------------------------- */

    /// How task identity is computed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IdentityMode<'a> {
        Plain,
        /// A trailing reference to `project` (inside `folder`) is ignored.
        /// References to other projects stay part of the identity.
        ProjectAware { folder: &'a str, project: &'a str },
    }

    /// One checklist item.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Task {
        /// The line as stored, trimmed, with `[X]` normalized to `[x]`.
        pub raw: String,
        pub checked: bool,
        /// Comparison key: unchecked form, without time prefix (and without
        /// project reference in project-aware mode).
        pub identity: String,
    }

    impl Task {
        pub fn parse(line: &str) -> Option<Task> {
            Self::parse_with(line, IdentityMode::Plain)
        }

        pub fn parse_with(line: &str, mode: IdentityMode<'_>) -> Option<Task> {
            let trimmed = line.trim();
            let (_, mark, _) = split_marker(trimmed)?;
            let text = body(trimmed)?;
            let checked = mark != ' ';
            let raw = format!("- [{}] {text}", if checked { 'x' } else { ' ' });

            let timeless = untick(&strip_time_prefix(&raw));
            body(&timeless)?;
            let identity = match mode {
                IdentityMode::Plain => timeless,
                IdentityMode::ProjectAware { folder, project } => match strip_project_ref(&timeless, folder) {
                    Some((stripped, reference)) if reference.project() == project => stripped,
                    _ => timeless,
                },
            };
            Some(Task {
                raw,
                checked,
                identity,
            })
        }

        /// Line written when this task is inserted into another document; the
        /// time of day belongs to the document that scheduled it.
        pub fn insert_line(&self) -> String {
            strip_time_prefix(&self.raw)
        }
    }

    /* ------------------------------- Task sets ------------------------------- */

    /// Tasks with unique identities, in insertion order.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TaskSet {
        tasks: IndexMap<String, Task>,
    }

    impl TaskSet {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every task in `lines`, in document order.
        pub fn from_lines<S: AsRef<str>>(lines: &[S], mode: IdentityMode<'_>) -> Self {
            lines
                .iter()
                .filter_map(|line| Task::parse_with(line.as_ref(), mode))
                .collect()
        }

        /// Adds a task. A repeated identity keeps its first position; a checked
        /// occurrence wins over an open one.
        pub fn insert(&mut self, task: Task) -> bool {
            match self.tasks.get_mut(&task.identity) {
                Some(existing) => {
                    if task.checked && !existing.checked {
                        *existing = task;
                    }
                    false
                }
                None => {
                    self.tasks.insert(task.identity.clone(), task);
                    true
                }
            }
        }

        pub fn get(&self, identity: &str) -> Option<&Task> {
            self.tasks.get(identity)
        }

        pub fn contains(&self, identity: &str) -> bool {
            self.tasks.contains_key(identity)
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = &Task> {
            self.tasks.values()
        }
    }

    impl FromIterator<Task> for TaskSet {
        fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
            let mut set = TaskSet::new();
            for task in iter {
                set.insert(task);
            }
            set
        }
    }

    impl IntoIterator for TaskSet {
        type Item = Task;
        type IntoIter = indexmap::map::IntoValues<String, Task>;

        fn into_iter(self) -> Self::IntoIter {
            self.tasks.into_values()
        }
    }

}

pub mod period {
    //! Calendar arithmetic and the mapping between periods and document paths.
    //!
    //! Weeks start on Monday. A week belongs to the month that contains its
    //! Sunday, so every month owns four or five whole weeks and month
    //! boundaries fall on the week grid.

    use crate::config::Folders;
    use crate::core::{Level, PlannerError, Result};
    use crate::storage::RelPath;
    use chrono::{Datelike, Days, NaiveDate, Weekday};
    use nom::{
        IResult,
        bytes::complete::take_while_m_n,
        character::complete::char,
        combinator::{all_consuming, map_res},
        error::VerboseError,
        sequence::tuple,
    };
    use serde::Serialize;
    use std::fmt;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const WEEKDAY_NAMES: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];

    const MONTH_NAMES: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];

    /* ------------------------------ Day math ------------------------------ */

    /// Calendar-day offset; saturates at the ends of the supported range.
    pub fn add_days(date: NaiveDate, n: i64) -> NaiveDate {
        let shifted = if n >= 0 {
            date.checked_add_days(Days::new(n.unsigned_abs()))
        } else {
            date.checked_sub_days(Days::new(n.unsigned_abs()))
        };
        shifted.unwrap_or(date)
    }

    /// Monday = 0 .. Sunday = 6.
    pub fn day_index_in_week(date: NaiveDate) -> u32 {
        date.weekday().num_days_from_monday()
    }

    pub fn monday(date: NaiveDate) -> NaiveDate {
        add_days(date, -i64::from(day_index_in_week(date)))
    }

    pub fn sunday(date: NaiveDate) -> NaiveDate {
        add_days(monday(date), 6)
    }

    /// Position of the date's week among the weeks its month owns (0-based).
    pub fn week_index_in_month(date: NaiveDate) -> u32 {
        let first = Month::owning(date).first_monday();
        let weeks = (monday(date) - first).num_days() / 7;
        weeks as u32
    }

    pub fn weekday_name(day: Weekday) -> &'static str {
        WEEKDAY_NAMES[day.num_days_from_monday() as usize]
    }

    /* ------------------------------- Months ------------------------------- */

    /// A calendar month, stored as its first day.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    pub struct Month(NaiveDate);

    impl Month {
        pub fn new(year: i32, month: u32) -> Option<Self> {
            NaiveDate::from_ymd_opt(year, month, 1).map(Self)
        }

        /// Calendar month the date falls in.
        pub fn of(date: NaiveDate) -> Self {
            Self(date.with_day(1).unwrap_or(date))
        }

        /// Month owning the date's week.
        pub fn owning(date: NaiveDate) -> Self {
            Self::of(sunday(date))
        }

        pub fn year(self) -> i32 {
            self.0.year()
        }

        /// Monday of the first owned week: the week containing the 1st, whose
        /// Sunday is at most the 7th.
        pub fn first_monday(self) -> NaiveDate {
            monday(self.0)
        }

        /// Mondays of the four or five weeks this month owns.
        pub fn weeks(self) -> Vec<NaiveDate> {
            let mut weeks = Vec::with_capacity(5);
            let mut start = self.first_monday();
            while Month::of(add_days(start, 6)) == self {
                weeks.push(start);
                start = add_days(start, 7);
            }
            weeks
        }

        pub fn name(self) -> &'static str {
            MONTH_NAMES[self.0.month0() as usize]
        }
    }

    impl fmt::Display for Month {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
        }
    }

    /* ------------------------------ Period keys ------------------------------ */

    /// Identifies the single document a period owns.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
    #[serde(tag = "level", content = "key", rename_all = "lowercase")]
    pub enum PeriodKey {
        Day(NaiveDate),
        /// Always a Monday.
        Week(NaiveDate),
        Month(Month),
        Project(String),
    }

    impl PeriodKey {
        pub fn day(date: NaiveDate) -> Self {
            Self::Day(date)
        }

        pub fn week_of(date: NaiveDate) -> Self {
            Self::Week(monday(date))
        }

        pub fn month_of(date: NaiveDate) -> Self {
            Self::Month(Month::owning(date))
        }

        pub fn project(name: impl Into<String>) -> Self {
            Self::Project(name.into())
        }

        pub fn level(&self) -> Level {
            match self {
                Self::Day(_) => Level::Day,
                Self::Week(_) => Level::Week,
                Self::Month(_) => Level::Month,
                Self::Project(_) => Level::Project,
            }
        }

        /// Enclosing date period, if any. Projects are reached through task
        /// references, not through the calendar.
        pub fn parent(&self) -> Option<Self> {
            match self {
                Self::Day(date) => Some(Self::week_of(*date)),
                Self::Week(start) => Some(Self::month_of(*start)),
                Self::Month(_) | Self::Project(_) => None,
            }
        }

        pub fn identifier(&self) -> String {
            match self {
                Self::Day(date) | Self::Week(date) => date.format("%Y-%m-%d").to_string(),
                Self::Month(month) => month.to_string(),
                Self::Project(name) => name.clone(),
            }
        }

        pub fn path(&self, folders: &Folders) -> RelPath {
            RelPath::new(folders.folder(self.level())).join(&format!("{}.md", self.identifier()))
        }

        pub fn parse_identifier(level: Level, input: &str) -> Result<Self> {
            let invalid = || PlannerError::InvalidPeriodKey {
                level,
                input: input.to_string(),
            };
            match level {
                Level::Day => all_consuming(parse_date)(input)
                    .map(|(_, date)| Self::Day(date))
                    .map_err(|_| invalid()),
                Level::Week => match all_consuming(parse_date)(input) {
                    Ok((_, date)) if date.weekday() == Weekday::Mon => Ok(Self::Week(date)),
                    _ => Err(invalid()),
                },
                Level::Month => all_consuming(parse_month)(input)
                    .map(|(_, month)| Self::Month(month))
                    .map_err(|_| invalid()),
                Level::Project => {
                    if input.trim().is_empty() || input.contains('/') {
                        Err(invalid())
                    } else {
                        Ok(Self::Project(input.to_string()))
                    }
                }
            }
        }

        /// Inverse of [`PeriodKey::path`] for a known level; only the file
        /// name is inspected.
        pub fn parse_path(level: Level, path: &RelPath) -> Result<Self> {
            let file = path.file_name().unwrap_or_default();
            match file.strip_suffix(".md") {
                Some(stem) => Self::parse_identifier(level, stem),
                None => Err(PlannerError::InvalidPeriodKey {
                    level,
                    input: path.to_string(),
                }),
            }
        }

        /// Which planner document, if any, lives at `path`. Files nested below
        /// a planner folder, or not ending in `.md`, are not planner documents.
        pub fn classify(path: &RelPath, folders: &Folders) -> Result<Option<Self>> {
            let Some((dir, file)) = path.as_str().rsplit_once('/') else {
                return Ok(None);
            };
            if !file.ends_with(".md") {
                return Ok(None);
            }
            match Level::ALL.into_iter().find(|level| folders.folder(*level) == dir) {
                Some(level) => Self::parse_path(level, path).map(Some),
                None => Ok(None),
            }
        }
    }

    impl fmt::Display for PeriodKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} {}", self.level(), self.identifier())
        }
    }

    /* ------------------------------- Parsers ------------------------------- */

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn year_month(i: &str) -> PResult<'_, (i32, u32)> {
        let (i, (y, _, m)) = tuple((
            map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| s.parse::<i32>()),
            char('-'),
            map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| s.parse::<u32>()),
        ))(i)?;
        Ok((i, (y, m)))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                year_month,
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| s.parse::<u32>()),
            )),
            |((y, m), _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_month(i: &str) -> PResult<'_, Month> {
        map_res(year_month, |(y, m)| Month::new(y, m).ok_or("invalid month"))(i)
    }

}

pub mod section {
    //! Finding the part of a parent document that belongs to one child period.
    //!
    //! A section starts after a heading whose text begins with the label
    //! (optionally as a `[label](target)` link) and runs to the next heading.
    //! Labels are matched case-insensitively and must end on a word boundary.

    use crate::core::{PlannerError, Result};
    use crate::period::weekday_name;
    use crate::task::{IdentityMode, TaskSet};
    use chrono::Weekday;
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::space1,
        error::VerboseError,
        sequence::terminated,
    };
    use std::{fmt, ops::Range};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const WEEKDAYS: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum SectionLabel {
        /// A day's section in its week document.
        Weekday(Weekday),
        /// A week's section in its month document, 1-based.
        Week(u32),
        /// Any other heading text.
        Named(String),
    }

    impl SectionLabel {
        pub fn for_day(day_index: u32) -> Self {
            Self::Weekday(WEEKDAYS[(day_index % 7) as usize])
        }

        pub fn for_week(week_index: u32) -> Self {
            Self::Week(week_index + 1)
        }

        pub fn weekdays() -> Vec<Self> {
            WEEKDAYS.into_iter().map(Self::Weekday).collect()
        }

        /// Reads a label typed by a person: a weekday name, `week N`, or
        /// anything else verbatim.
        pub fn parse(input: &str) -> Self {
            let input = input.trim();
            if let Some(day) = WEEKDAYS
                .into_iter()
                .find(|day| weekday_name(*day).eq_ignore_ascii_case(input))
            {
                return Self::Weekday(day);
            }
            let week = input
                .get(..4)
                .filter(|head| head.eq_ignore_ascii_case("week"))
                .and_then(|_| input[4..].trim().parse::<u32>().ok());
            match week {
                Some(n) => Self::Week(n),
                None => Self::Named(input.to_string()),
            }
        }

        /// Lowercase text a matching heading starts with.
        pub fn needle(&self) -> String {
            match self {
                Self::Weekday(day) => weekday_name(*day).to_ascii_lowercase(),
                Self::Week(n) => format!("week {n}"),
                Self::Named(text) => text.to_lowercase(),
            }
        }
    }

    impl fmt::Display for SectionLabel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Weekday(day) => f.write_str(weekday_name(*day)),
                Self::Week(n) => write!(f, "Week {n}"),
                Self::Named(text) => f.write_str(text),
            }
        }
    }

    /* ------------------------------ Line kinds ------------------------------ */

    fn heading_marker(i: &str) -> PResult<'_, &str> {
        terminated(take_while1(|c: char| c == '#'), space1)(i)
    }

    /// Text of a markdown heading line, without its `#` marker.
    pub fn heading_text(line: &str) -> Option<&str> {
        heading_marker(line).ok().map(|(text, _)| text)
    }

    pub fn is_heading(line: &str) -> bool {
        heading_text(line).is_some()
    }

    pub fn is_rule(line: &str) -> bool {
        line.trim_start().starts_with("---")
    }

    pub fn heading_matches(line: &str, label: &SectionLabel) -> bool {
        let Some(text) = heading_text(line) else {
            return false;
        };
        let text = text.strip_prefix('[').unwrap_or(text);
        let needle = label.needle();
        let mut expected = needle.chars().peekable();
        let mut chars = text.chars();
        while expected.peek().is_some() {
            let Some(c) = chars.next() else {
                return false;
            };
            // One char may lowercase to several.
            for lower in c.to_lowercase() {
                if expected.next() != Some(lower) {
                    return false;
                }
            }
        }
        !chars.next().is_some_and(char::is_alphanumeric)
    }

    /* ------------------------------- Locating ------------------------------- */

    /// Body lines of the first section headed by `label`.
    pub fn locate<S: AsRef<str>>(lines: &[S], label: &SectionLabel) -> Result<Range<usize>> {
        let heading = lines
            .iter()
            .position(|line| heading_matches(line.as_ref(), label))
            .ok_or_else(|| PlannerError::SectionNotFound(label.to_string()))?;
        let start = heading + 1;
        let end = lines[start..]
            .iter()
            .position(|line| is_heading(line.as_ref()))
            .map_or(lines.len(), |offset| start + offset);
        Ok(start..end)
    }

    /// First line where new content goes: past a `---` rule under the heading.
    pub fn body_start<S: AsRef<str>>(lines: &[S], section: &Range<usize>) -> usize {
        match lines.get(section.start) {
            Some(line) if section.start < section.end && is_rule(line.as_ref()) => section.start + 1,
            _ => section.start,
        }
    }

    /// Tasks inside the labelled section; a missing section has none.
    pub fn section_tasks<S: AsRef<str>>(
        lines: &[S],
        label: &SectionLabel,
        mode: IdentityMode<'_>,
    ) -> TaskSet {
        match locate(lines, label) {
            Ok(range) => TaskSet::from_lines(&lines[range], mode),
            Err(err) => {
                tracing::debug!(%label, error = %err, "section missing, no tasks");
                TaskSet::new()
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const WEEK: &[&str] = &[
            "# [Monday](Days/2024-03-04.md)",
            "---",
            "- [ ] standup",
            "",
            "## Tuesday notes",
            "- [ ] review",
            "# Wednesday",
            "- [x] gym",
        ];

        #[test]
        fn locates_linked_and_plain_headings() {
            let monday = locate(WEEK, &SectionLabel::Weekday(Weekday::Mon)).expect("monday");
            assert_eq!(monday, 1..4);
            assert_eq!(body_start(WEEK, &monday), 2);

            let tuesday = locate(WEEK, &SectionLabel::Weekday(Weekday::Tue)).expect("tuesday");
            assert_eq!(tuesday, 5..6);

            let wednesday = locate(WEEK, &SectionLabel::Weekday(Weekday::Wed)).expect("wednesday");
            assert_eq!(wednesday, 7..8);
        }

        #[test]
        fn missing_section_has_no_tasks() {
            let lines = ["# Monday", "- [ ] standup"];
            let label = SectionLabel::Weekday(Weekday::Tue);
            assert!(matches!(locate(&lines, &label), Err(PlannerError::SectionNotFound(_))));
            assert!(section_tasks(&lines, &label, IdentityMode::Plain).is_empty());
        }

        #[test]
        fn week_labels_stop_at_word_boundary() {
            let month = ["# Week 10", "- [ ] wrong", "# [Week 1](Weeks/2024-02-26.md)", "- [ ] right"];
            let tasks = section_tasks(&month, &SectionLabel::Week(1), IdentityMode::Plain);
            let raw: Vec<_> = tasks.iter().map(|t| t.raw.as_str()).collect();
            assert_eq!(raw, ["- [ ] right"]);
            assert!(!heading_matches("# Mondays", &SectionLabel::Weekday(Weekday::Mon)));
            assert!(heading_matches("### MONDAY 4th", &SectionLabel::Weekday(Weekday::Mon)));
        }

        #[test]
        fn named_labels_match_non_ascii_headings() {
            // Lowercasing changes the byte length of both labels.
            let arbeit = SectionLabel::Named("Ⱥrbeit".into());
            assert!(heading_matches("## ȺRBEIT", &arbeit));
            assert!(heading_matches("## ⱥrbeit notes", &arbeit));
            assert!(!heading_matches("## Ⱥrbeiten", &arbeit));

            let istanbul = SectionLabel::Named("İstanbul".into());
            assert!(heading_matches("# [İstanbul](Projects/Trip.md)", &istanbul));
            assert!(!heading_matches("# Istanbul", &istanbul));

            let lines = ["# Plans", "## ȺRBEIT", "- [ ] file report", "## Home"];
            let tasks = section_tasks(&lines, &arbeit, IdentityMode::Plain);
            assert_eq!(tasks.len(), 1);
        }

        #[test]
        fn headings_need_a_space_after_the_marker() {
            assert!(is_heading("## Day Planner"));
            assert!(!is_heading("#tag line"));
            assert!(!is_heading("- [ ] # not a heading"));
        }

        #[test]
        fn labels_parse_from_user_input() {
            assert_eq!(SectionLabel::parse("friday"), SectionLabel::Weekday(Weekday::Fri));
            assert_eq!(SectionLabel::parse("Week 3"), SectionLabel::Week(3));
            assert_eq!(SectionLabel::parse("Morning"), SectionLabel::Named("Morning".into()));
            assert_eq!(SectionLabel::for_day(6).to_string(), "Sunday");
            assert_eq!(SectionLabel::for_week(0).to_string(), "Week 1");
        }
    }
}

pub mod reconcile {
    //! Merging an incoming task set into a document.
    //!
    //! Existing lines are only ever re-ticked; tasks the document lacks are
    //! inserted as a block, either under a preserved title or at the top of a
    //! named section. Running the same merge twice changes nothing.

    use crate::core::Level;
    use crate::section::{self, SectionLabel, heading_matches, is_heading, is_rule};
    use crate::task::{IdentityMode, Task, TaskSet, tick, untick};

    /// Applies the check state of matching incoming tasks to `lines`.
    /// Returns the new lines and how many of them changed.
    pub fn update_ticks(lines: &[String], incoming: &TaskSet, mode: IdentityMode<'_>) -> (Vec<String>, usize) {
        let mut changed = 0;
        let updated: Vec<String> = lines
            .iter()
            .map(|line| {
                let Some(local) = Task::parse_with(line, mode) else {
                    return line.clone();
                };
                match incoming.get(&local.identity) {
                    Some(task) if task.checked != local.checked => {
                        changed += 1;
                        if task.checked { tick(line) } else { untick(line) }
                    }
                    _ => line.clone(),
                }
            })
            .collect();
        (updated, changed)
    }

    /// Incoming tasks whose identity appears nowhere in `lines`.
    pub fn new_tasks(lines: &[String], incoming: &TaskSet, mode: IdentityMode<'_>) -> TaskSet {
        let present = TaskSet::from_lines(lines, mode);
        incoming
            .iter()
            .filter(|task| !present.contains(&task.identity))
            .cloned()
            .collect()
    }

    /// Where missing tasks go.
    #[derive(Debug, Clone, Copy)]
    pub enum Placement<'a> {
        /// Top of the document, below a preserved title.
        Document,
        /// Top of a section; the whole document if the section is absent.
        Section(&'a SectionLabel),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Merge {
        pub lines: Vec<String>,
        pub inserted: TaskSet,
        pub retoggled: usize,
    }

    impl Merge {
        pub fn changed(&self) -> bool {
            self.retoggled > 0 || !self.inserted.is_empty()
        }
    }

    /// Merge rules for one target document.
    #[derive(Debug, Clone)]
    pub struct Reconciler<'a> {
        reserved: Vec<SectionLabel>,
        mode: IdentityMode<'a>,
    }

    impl<'a> Reconciler<'a> {
        pub fn new(reserved: Vec<SectionLabel>, mode: IdentityMode<'a>) -> Self {
            Self { reserved, mode }
        }

        pub fn for_level(level: Level, mode: IdentityMode<'a>) -> Self {
            Self::new(level.reserved_labels(), mode)
        }

        pub fn merge(&self, lines: &[String], incoming: &TaskSet, placement: Placement<'_>) -> Merge {
            let (mut updated, retoggled) = update_ticks(lines, incoming, self.mode);
            let inserted = new_tasks(&updated, incoming, self.mode);
            if !inserted.is_empty() {
                let at = match placement {
                    Placement::Document => self.title_len(&updated),
                    Placement::Section(label) => match section::locate(&updated, label) {
                        Ok(range) => section::body_start(&updated, &range),
                        Err(_) => {
                            tracing::debug!(%label, "section missing, inserting at top");
                            self.title_len(&updated)
                        }
                    },
                };
                let block: Vec<String> = inserted.iter().map(Task::insert_line).collect();
                updated.splice(at..at, block);
            }
            Merge {
                lines: updated,
                inserted,
                retoggled,
            }
        }

        /// Number of leading lines kept above inserted tasks: a first heading
        /// that is not a section of this level, plus a `---` right under it.
        pub fn title_len(&self, lines: &[String]) -> usize {
            let Some(first) = lines.first() else {
                return 0;
            };
            if !is_heading(first) || self.reserved.iter().any(|label| heading_matches(first, label)) {
                return 0;
            }
            match lines.get(1) {
                Some(line) if is_rule(line) => 2,
                _ => 1,
            }
        }
    }

    /// Merges `incoming` at the top of the document.
    pub fn reconcile(lines: &[String], incoming: &TaskSet, reserved: &[SectionLabel]) -> Vec<String> {
        Reconciler::new(reserved.to_vec(), IdentityMode::Plain)
            .merge(lines, incoming, Placement::Document)
            .lines
    }

    /// Merges `incoming` at the top of the labelled section.
    pub fn reconcile_into_section(
        lines: &[String],
        label: &SectionLabel,
        incoming: &TaskSet,
        reserved: &[SectionLabel],
    ) -> Vec<String> {
        Reconciler::new(reserved.to_vec(), IdentityMode::Plain)
            .merge(lines, incoming, Placement::Section(label))
            .lines
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::Weekday;
        use proptest::prelude::*;

        fn lines(text: &[&str]) -> Vec<String> {
            text.iter().map(|s| s.to_string()).collect()
        }

        fn set(text: &[&str]) -> TaskSet {
            text.iter().filter_map(|line| Task::parse(line)).collect()
        }

        #[test]
        fn inserts_below_preserved_title() {
            let doc = lines(&["# Monday", "---", "- [ ] buy milk"]);
            let out = reconcile(&doc, &set(&["- [ ] buy milk", "- [ ] call dentist"]), &[]);
            assert_eq!(out, lines(&["# Monday", "---", "- [ ] call dentist", "- [ ] buy milk"]));
        }

        #[test]
        fn ticks_without_inserting() {
            let doc = lines(&["# Monday", "---", "- [ ] buy milk"]);
            let out = reconcile(&doc, &set(&["- [x] buy milk"]), &[]);
            assert_eq!(out, lines(&["# Monday", "---", "- [x] buy milk"]));

            let back = reconcile(&out, &set(&["- [ ] buy milk"]), &[]);
            assert_eq!(back, doc);
        }

        #[test]
        fn reserved_first_heading_is_not_a_title() {
            let doc = lines(&["# Monday", "---", "- [ ] a"]);
            let out = reconcile(&doc, &set(&["- [ ] b"]), &SectionLabel::weekdays());
            assert_eq!(out, lines(&["- [ ] b", "# Monday", "---", "- [ ] a"]));
        }

        #[test]
        fn section_insert_keeps_indentation_and_times_of_existing_lines() {
            let doc = lines(&[
                "# [Monday](Days/2024-03-04.md)",
                "---",
                "",
                "# [Tuesday](Days/2024-03-05.md)",
                "---",
                "  - [ ] 09:00 standup",
                "",
            ]);
            let incoming = set(&["- [x] standup", "- [ ] 14:00 write report"]);
            let label = SectionLabel::Weekday(Weekday::Tue);
            let merge = Reconciler::for_level(Level::Week, IdentityMode::Plain).merge(
                &doc,
                &incoming,
                Placement::Section(&label),
            );
            assert_eq!(
                merge.lines,
                lines(&[
                    "# [Monday](Days/2024-03-04.md)",
                    "---",
                    "",
                    "# [Tuesday](Days/2024-03-05.md)",
                    "---",
                    "- [ ] write report",
                    "  - [x] 09:00 standup",
                    "",
                ])
            );
            assert_eq!(merge.retoggled, 1);
            assert_eq!(merge.inserted.len(), 1);
        }

        #[test]
        fn missing_section_falls_back_to_document_top() {
            let doc = lines(&["# Plans", "---", "# Monday", "- [ ] a"]);
            let label = SectionLabel::Weekday(Weekday::Fri);
            let out = reconcile_into_section(&doc, &label, &set(&["- [ ] b"]), &SectionLabel::weekdays());
            assert_eq!(out, lines(&["# Plans", "---", "- [ ] b", "# Monday", "- [ ] a"]));
        }

        #[test]
        fn presence_anywhere_prevents_insertion() {
            let doc = lines(&["# Monday", "- [ ] a", "# Tuesday", ""]);
            let label = SectionLabel::Weekday(Weekday::Tue);
            let out = reconcile_into_section(&doc, &label, &set(&["- [x] a"]), &SectionLabel::weekdays());
            assert_eq!(out, lines(&["# Monday", "- [x] a", "# Tuesday", ""]));
        }

        const LAUNCH: IdentityMode<'static> = IdentityMode::ProjectAware {
            folder: "Projects",
            project: "Launch",
        };

        #[test]
        fn project_aware_merge_matches_across_reference_forms() {
            let doc = lines(&["# Launch", "---", "- [ ] ship release"]);
            let incoming: TaskSet = ["- [x] ship release #Launch"]
                .into_iter()
                .filter_map(|l| Task::parse_with(l, LAUNCH))
                .collect();
            let merge = Reconciler::for_level(Level::Project, LAUNCH).merge(&doc, &incoming, Placement::Document);
            assert_eq!(merge.lines, lines(&["# Launch", "---", "- [x] ship release"]));
            assert!(merge.inserted.is_empty());
        }

        #[test]
        fn other_project_tasks_are_left_alone() {
            let doc = lines(&["# [Week 1](Weeks/2024-02-26.md)", "---", "- [ ] review #Other"]);
            let incoming: TaskSet = Task::parse_with("- [x] review [Launch](Projects/Launch.md)", LAUNCH)
                .into_iter()
                .collect();
            let label = SectionLabel::Week(1);
            let merge = Reconciler::for_level(Level::Month, LAUNCH).merge(&doc, &incoming, Placement::Section(&label));
            assert_eq!(
                merge.lines,
                lines(&[
                    "# [Week 1](Weeks/2024-02-26.md)",
                    "---",
                    "- [x] review [Launch](Projects/Launch.md)",
                    "- [ ] review #Other",
                ])
            );
            assert_eq!(merge.retoggled, 0);
        }

        fn task_text() -> impl Strategy<Value = String> {
            (
                "[ x]",
                prop::option::of("0[7-9]:[0-5]0"),
                "[a-c]",
                prop::sample::select(vec!["", " #Launch", " #Other", " [Launch](Projects/Launch.md)"]),
            )
                .prop_map(|(m, time, t, reference)| match time {
                    Some(time) => format!("- [{m}] {time} {t}{reference}"),
                    None => format!("- [{m}] {t}{reference}"),
                })
        }

        fn doc_line() -> impl Strategy<Value = String> {
            prop_oneof![
                "[a-z]{1,6}( [a-z]{1,6})?\\.",
                "# [A-Z][a-z]{2,6}",
                Just("# Monday".to_string()),
                Just("# [Tuesday](Days/2024-03-05.md)".to_string()),
                Just("## Day Planner".to_string()),
                Just("# [Week 1](Weeks/2024-02-26.md)".to_string()),
                Just("# Week 2".to_string()),
                Just("---".to_string()),
                Just(String::new()),
                ("[ \t]{0,2}", task_text()).prop_map(|(indent, task)| format!("{indent}{task}")),
            ]
        }

        proptest! {
            #[test]
            fn merge_is_idempotent(
                doc in prop::collection::vec(doc_line(), 0..12),
                incoming in prop::collection::vec(task_text(), 0..6),
                level in prop::sample::select(vec![Level::Day, Level::Week, Level::Month, Level::Project]),
                aware in any::<bool>(),
                section in prop::option::of(prop::sample::select(vec![
                    SectionLabel::Weekday(Weekday::Tue),
                    SectionLabel::Week(1),
                    SectionLabel::Week(2),
                    SectionLabel::Named("day planner".to_string()),
                ])),
            ) {
                let mode = if aware { LAUNCH } else { IdentityMode::Plain };
                let incoming: TaskSet = incoming
                    .iter()
                    .filter_map(|line| Task::parse_with(line, mode))
                    .collect();
                let placement = match &section {
                    Some(label) => Placement::Section(label),
                    None => Placement::Document,
                };
                let reconciler = Reconciler::for_level(level, mode);
                let once = reconciler.merge(&doc, &incoming, placement);
                let twice = reconciler.merge(&once.lines, &incoming, placement);
                prop_assert!(!twice.changed());
                prop_assert_eq!(&once.lines, &twice.lines);

                if !aware {
                    let reserved = level.reserved_labels();
                    let free = match &section {
                        Some(label) => reconcile_into_section(&doc, label, &incoming, &reserved),
                        None => reconcile(&doc, &incoming, &reserved),
                    };
                    prop_assert_eq!(&free, &once.lines);
                }
            }
        }
    }
}

pub mod storage {
    //! Document access.
    //!
    //! Paths are vault-relative (`RelPath`). A `DocHandle` can only be had by
    //! reading or creating a document, so nothing is ever written to a path
    //! that was not read first (or created with template content).

    use crate::core::{PlannerError, Result};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        fmt, fs,
        io::{self, Write},
        path::{Component, Path, PathBuf},
    };

    /* ---------------------------- Value Objects ---------------------------- */

    /// A POSIX-like relative path from the vault root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RelPath(String);

    impl RelPath {
        pub fn new(path: &str) -> Self {
            let path = path.replace('\\', "/");
            let path = path.trim_start_matches("./").trim_matches('/');
            Self(path.to_string())
        }

        /// Builds a `RelPath` from plain path components; `None` for anything
        /// with roots, prefixes or `..`.
        pub fn from_path(path: &Path) -> Option<Self> {
            let mut parts = Vec::new();
            for component in path.components() {
                match component {
                    Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                    Component::CurDir => {}
                    _ => return None,
                }
            }
            (!parts.is_empty()).then(|| Self(parts.join("/")))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn join(&self, segment: &str) -> Self {
            if self.0.is_empty() {
                Self(segment.to_string())
            } else {
                Self(format!("{}/{}", self.0, segment))
            }
        }

        pub fn file_name(&self) -> Option<&str> {
            if self.0.is_empty() {
                None
            } else {
                self.0.rsplit('/').next()
            }
        }
    }

    impl fmt::Display for RelPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Proof that a document was read or created through a store.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DocHandle(RelPath);

    impl DocHandle {
        pub fn path(&self) -> &RelPath {
            &self.0
        }
    }

    /* -------------------------------- Store -------------------------------- */

    pub trait DocumentStore {
        fn exists(&self, path: &RelPath) -> bool;

        /// Fails with `DocumentNotFound` when there is nothing at `path`.
        fn read(&self, path: &RelPath) -> Result<(DocHandle, String)>;

        /// Creates a new document; an existing one is an error.
        fn create(&mut self, path: &RelPath, text: &str) -> Result<DocHandle>;

        fn write(&mut self, handle: &DocHandle, text: &str) -> Result<()>;

        /// Every markdown document in the vault, sorted.
        fn list_all(&self) -> Result<Vec<RelPath>>;
    }

    /// A document as lines split on `\n`; joining restores the text exactly.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Document {
        pub handle: DocHandle,
        pub lines: Vec<String>,
    }

    impl Document {
        pub fn new(handle: DocHandle, text: &str) -> Self {
            Self {
                handle,
                lines: text.split('\n').map(str::to_string).collect(),
            }
        }

        /// Reads the document at `path`; `None` if it does not exist.
        pub fn load(store: &dyn DocumentStore, path: &RelPath) -> Result<Option<Self>> {
            match store.read(path) {
                Ok((handle, text)) => Ok(Some(Self::new(handle, &text))),
                Err(PlannerError::DocumentNotFound(_)) => Ok(None),
                Err(err) => Err(err),
            }
        }

        pub fn text(&self) -> String {
            self.lines.join("\n")
        }
    }

    /* ------------------------------ Filesystem ------------------------------ */

    /// Documents stored as files below a vault directory.
    #[derive(Debug, Clone)]
    pub struct FsStore {
        root: PathBuf,
    }

    impl FsStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn abs_path(&self, rel: &RelPath) -> PathBuf {
            rel.as_str().split('/').fold(self.root.clone(), |acc, part| acc.join(part))
        }

        fn store_err(path: &RelPath, source: io::Error) -> PlannerError {
            if source.kind() == io::ErrorKind::NotFound {
                PlannerError::DocumentNotFound(path.to_string())
            } else {
                PlannerError::Store {
                    path: path.to_string(),
                    source,
                }
            }
        }

        fn visit_dir(&self, dir: &Path, rel: &RelPath, out: &mut Vec<RelPath>) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if file_type.is_dir() {
                    if !name.starts_with('.') {
                        self.visit_dir(&entry.path(), &rel.join(&name), out)?;
                    }
                } else if name.ends_with(".md") {
                    out.push(rel.join(&name));
                }
            }
            Ok(())
        }
    }

    impl DocumentStore for FsStore {
        fn exists(&self, path: &RelPath) -> bool {
            self.abs_path(path).is_file()
        }

        fn read(&self, path: &RelPath) -> Result<(DocHandle, String)> {
            let text = fs::read_to_string(self.abs_path(path)).map_err(|err| Self::store_err(path, err))?;
            Ok((DocHandle(path.clone()), text))
        }

        fn create(&mut self, path: &RelPath, text: &str) -> Result<DocHandle> {
            let abs = self.abs_path(path);
            let store = |source| PlannerError::Store {
                path: path.to_string(),
                source,
            };
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).map_err(store)?;
            }
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .map_err(store)?;
            file.write_all(text.as_bytes()).map_err(store)?;
            Ok(DocHandle(path.clone()))
        }

        fn write(&mut self, handle: &DocHandle, text: &str) -> Result<()> {
            fs::write(self.abs_path(handle.path()), text.as_bytes())
                .map_err(|err| Self::store_err(handle.path(), err))
        }

        fn list_all(&self) -> Result<Vec<RelPath>> {
            let mut out = Vec::new();
            self.visit_dir(&self.root, &RelPath::new(""), &mut out)
                .map_err(|source| PlannerError::Store {
                    path: self.root.display().to_string(),
                    source,
                })?;
            out.sort();
            Ok(out)
        }
    }

    /* ------------------------------- In memory ------------------------------- */

    /// Store kept in memory; records every create and write in order.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        docs: IndexMap<RelPath, String>,
        writes: Vec<RelPath>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a document without recording a write.
        pub fn insert(&mut self, path: &str, text: &str) {
            self.docs.insert(RelPath::new(path), text.to_string());
        }

        pub fn text(&self, path: &str) -> Option<&str> {
            self.docs.get(&RelPath::new(path)).map(String::as_str)
        }

        pub fn writes(&self) -> &[RelPath] {
            &self.writes
        }

        pub fn clear_writes(&mut self) {
            self.writes.clear();
        }
    }

    impl DocumentStore for MemoryStore {
        fn exists(&self, path: &RelPath) -> bool {
            self.docs.contains_key(path)
        }

        fn read(&self, path: &RelPath) -> Result<(DocHandle, String)> {
            self.docs
                .get(path)
                .map(|text| (DocHandle(path.clone()), text.clone()))
                .ok_or_else(|| PlannerError::DocumentNotFound(path.to_string()))
        }

        fn create(&mut self, path: &RelPath, text: &str) -> Result<DocHandle> {
            if self.docs.contains_key(path) {
                return Err(PlannerError::Store {
                    path: path.to_string(),
                    source: io::Error::from(io::ErrorKind::AlreadyExists),
                });
            }
            self.docs.insert(path.clone(), text.to_string());
            self.writes.push(path.clone());
            Ok(DocHandle(path.clone()))
        }

        fn write(&mut self, handle: &DocHandle, text: &str) -> Result<()> {
            self.docs.insert(handle.path().clone(), text.to_string());
            self.writes.push(handle.path().clone());
            Ok(())
        }

        fn list_all(&self) -> Result<Vec<RelPath>> {
            let mut all: Vec<RelPath> = self.docs.keys().cloned().collect();
            all.sort();
            Ok(all)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn document_text_round_trips_trailing_newlines() {
            let mut store = MemoryStore::new();
            for text in ["", "a", "a\n", "a\n\n", "\n- [ ] b\n"] {
                store.insert("Days/x.md", text);
                let doc = Document::load(&store, &RelPath::new("Days/x.md"))
                    .expect("read")
                    .expect("exists");
                assert_eq!(doc.text(), text);
            }
            assert_eq!(Document::load(&store, &RelPath::new("Days/y.md")).expect("read"), None);
        }

        #[test]
        fn rel_paths_normalize() {
            assert_eq!(RelPath::new("./Days/2024-03-04.md").as_str(), "Days/2024-03-04.md");
            assert_eq!(RelPath::new("Weeks\\2024-03-04.md").as_str(), "Weeks/2024-03-04.md");
            assert_eq!(
                RelPath::from_path(Path::new("Months/2024-03.md")),
                Some(RelPath::new("Months/2024-03.md"))
            );
            assert_eq!(RelPath::from_path(Path::new("../outside.md")), None);
            assert_eq!(RelPath::new("Projects/Launch.md").file_name(), Some("Launch.md"));
        }

        #[test]
        fn fs_store_creates_reads_and_lists() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut store = FsStore::new(tmp.path());
            let path = RelPath::new("Weeks/2024-03-04.md");

            assert!(!store.exists(&path));
            assert!(matches!(store.read(&path), Err(PlannerError::DocumentNotFound(_))));

            let handle = store.create(&path, "# [Monday](Days/2024-03-04.md)\n").expect("create");
            assert!(store.exists(&path));
            assert!(store.create(&path, "again").is_err());

            store.write(&handle, "- [ ] a\n").expect("write");
            let (_, text) = store.read(&path).expect("read");
            assert_eq!(text, "- [ ] a\n");

            fs::create_dir_all(tmp.path().join(".obsidian")).expect("mkdir");
            fs::write(tmp.path().join(".obsidian/hidden.md"), "x").expect("write hidden");
            fs::write(tmp.path().join("notes.txt"), "x").expect("write txt");
            store.create(&RelPath::new("Days/2024-03-04.md"), "").expect("create day");

            assert_eq!(
                store.list_all().expect("list"),
                vec![RelPath::new("Days/2024-03-04.md"), path]
            );
        }
    }
}

pub mod template {
    //! Initial content for new planner documents.

    use crate::config::Folders;
    use crate::period::{Month, PeriodKey, add_days, week_index_in_month, weekday_name};
    use chrono::{Datelike, NaiveDate};

    /// Day: title linking to its week and month, then the day planner.
    pub fn day(date: NaiveDate, folders: &Folders) -> String {
        let month = Month::owning(date);
        format!(
            "# {weekday} [Week {week}]({week_path}) [{month_name}]({month_path}) {year}\n---\n## Day Planner\n---\n### Morning\n\n### Afternoon\n\n### Evening\n\n",
            weekday = weekday_name(date.weekday()),
            week = week_index_in_month(date) + 1,
            week_path = PeriodKey::week_of(date).path(folders),
            month_name = month.name(),
            month_path = PeriodKey::Month(month).path(folders),
            year = month.year(),
        )
    }

    /// Week: one linked heading per day.
    pub fn week(monday: NaiveDate, folders: &Folders) -> String {
        (0..7)
            .map(|offset| {
                let date = add_days(monday, offset);
                format!(
                    "# [{}]({})\n---\n\n",
                    weekday_name(date.weekday()),
                    PeriodKey::day(date).path(folders)
                )
            })
            .collect()
    }

    /// Month: one linked `Week N` heading per owned week.
    pub fn month(month: Month, folders: &Folders) -> String {
        month
            .weeks()
            .into_iter()
            .enumerate()
            .map(|(idx, monday)| {
                format!(
                    "# [Week {}]({})\n---\n\n",
                    idx + 1,
                    PeriodKey::Week(monday).path(folders)
                )
            })
            .collect()
    }

    pub fn project(name: &str) -> String {
        format!("# {name}\n---\n")
    }

    pub fn for_key(key: &PeriodKey, folders: &Folders) -> String {
        match key {
            PeriodKey::Day(date) => day(*date, folders),
            PeriodKey::Week(monday) => week(*monday, folders),
            PeriodKey::Month(m) => month(*m, folders),
            PeriodKey::Project(name) => project(name),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::section::{SectionLabel, locate};

        #[test]
        fn day_title_links_week_and_month() {
            let date = NaiveDate::from_ymd_opt(2024, 3, 5).expect("date");
            let text = day(date, &Folders::default());
            let first = text.lines().next().expect("title");
            assert_eq!(
                first,
                "# Tuesday [Week 2](Weeks/2024-03-04.md) [March](Months/2024-03.md) 2024"
            );
            assert!(text.contains("\n## Day Planner\n"));
        }

        #[test]
        fn week_and_month_templates_have_every_section() {
            let folders = Folders::default();
            let monday = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");
            let week_text = week(monday, &folders);
            let lines: Vec<&str> = week_text.split('\n').collect();
            for label in SectionLabel::weekdays() {
                assert!(locate(&lines, &label).is_ok(), "{label} missing");
            }
            assert!(lines[0].starts_with("# [Monday](Days/2024-03-04.md)"));

            let march = Month::new(2024, 3).expect("month");
            let month_text = month(march, &folders);
            assert_eq!(month_text.matches("# [Week ").count(), 5);
            assert!(month_text.starts_with("# [Week 1](Weeks/2024-02-26.md)\n---\n"));
        }
    }
}

pub mod config {
    //! Vault configuration read from `planner.toml` at the vault root.
    //!
    //! ```toml
    //! [folders]
    //! day = "Days"
    //!
    //! [create]
    //! day = false
    //!
    //! [projects]
    //! reference = "tag"
    //! ```
    //!
    //! Every key is optional.

    use crate::core::Level;
    use crate::task::ReferenceStyle;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    pub const CONFIG_FILE: &str = "planner.toml";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct VaultConfig {
        pub folders: Folders,
        pub create: CreatePolicy,
        pub projects: ProjectConfig,
    }

    /// Folder holding each level's documents, relative to the vault root.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Folders {
        pub day: String,
        pub week: String,
        pub month: String,
        pub project: String,
    }

    impl Default for Folders {
        fn default() -> Self {
            Self {
                day: "Days".into(),
                week: "Weeks".into(),
                month: "Months".into(),
                project: "Projects".into(),
            }
        }
    }

    impl Folders {
        pub fn folder(&self, level: Level) -> &str {
            match level {
                Level::Day => &self.day,
                Level::Week => &self.week,
                Level::Month => &self.month,
                Level::Project => &self.project,
            }
        }
    }

    /// Whether a missing document is created from its template when a pass
    /// reaches it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CreatePolicy {
        pub day: bool,
        pub week: bool,
        pub month: bool,
        pub project: bool,
    }

    impl Default for CreatePolicy {
        fn default() -> Self {
            Self {
                day: Level::Day.creates_missing(),
                week: Level::Week.creates_missing(),
                month: Level::Month.creates_missing(),
                project: Level::Project.creates_missing(),
            }
        }
    }

    impl CreatePolicy {
        pub fn creates(&self, level: Level) -> bool {
            match level {
                Level::Day => self.day,
                Level::Week => self.week,
                Level::Month => self.month,
                Level::Project => self.project,
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ProjectConfig {
        /// Reference appended to project tasks when they flow back to months.
        pub reference: ReferenceStyle,
    }

    /// Loads `planner.toml` from the vault root; defaults when absent.
    pub fn load_config(vault: &Path) -> Result<VaultConfig> {
        let path = vault.join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(VaultConfig::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        toml::from_str::<VaultConfig>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

}

pub mod propagate {
    //! Propagation passes.
    //!
    //! A pass starts at the document that was just edited and follows the
    //! edge list away from it. Downward edges push a parent's sections into
    //! the child documents; upward edges push a child's tasks into its
    //! section of the parent. Each branch keeps a single direction and the
    //! origin document is never written.

    use crate::config::VaultConfig;
    use crate::core::{Direction, Level, PlannerError, Result};
    use crate::period::{Month, PeriodKey, add_days, day_index_in_week, week_index_in_month};
    use crate::reconcile::{Placement, Reconciler};
    use crate::section::{SectionLabel, section_tasks};
    use crate::storage::{Document, DocumentStore, RelPath};
    use crate::task::{IdentityMode, ProjectRef, Task, TaskSet, strip_project_ref};
    use crate::template;
    use chrono::{Local, NaiveDate};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::fmt;
    use uuid::Uuid;

    /* -------------------------------- Clock -------------------------------- */

    /// Source of "today"; the only time input of a pass.
    pub trait Clock {
        fn today(&self) -> NaiveDate;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            Local::now().date_naive()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    /* -------------------------------- Edges -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct Edge {
        pub from: Level,
        pub to: Level,
        pub direction: Direction,
    }

    impl fmt::Display for Edge {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}->{}", self.from, self.to)
        }
    }

    pub const DAY_TO_WEEK: Edge = Edge {
        from: Level::Day,
        to: Level::Week,
        direction: Direction::Up,
    };
    pub const WEEK_TO_MONTH: Edge = Edge {
        from: Level::Week,
        to: Level::Month,
        direction: Direction::Up,
    };
    pub const MONTH_TO_PROJECT: Edge = Edge {
        from: Level::Month,
        to: Level::Project,
        direction: Direction::Up,
    };
    pub const MONTH_TO_WEEK: Edge = Edge {
        from: Level::Month,
        to: Level::Week,
        direction: Direction::Down,
    };
    pub const WEEK_TO_DAY: Edge = Edge {
        from: Level::Week,
        to: Level::Day,
        direction: Direction::Down,
    };
    /// Catch-up: a project's tasks reach the current and later months.
    pub const PROJECT_TO_MONTH: Edge = Edge {
        from: Level::Project,
        to: Level::Month,
        direction: Direction::Down,
    };

    pub const EDGES: [Edge; 6] = [
        DAY_TO_WEEK,
        WEEK_TO_MONTH,
        MONTH_TO_PROJECT,
        MONTH_TO_WEEK,
        WEEK_TO_DAY,
        PROJECT_TO_MONTH,
    ];

    pub fn edges_from(level: Level, direction: Direction) -> impl Iterator<Item = Edge> {
        EDGES
            .into_iter()
            .filter(move |edge| edge.from == level && edge.direction == direction)
    }

    /* -------------------------------- Reports -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct PassId(pub Uuid);

    impl PassId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for PassId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum HopOutcome {
        Updated,
        Created,
        Unchanged,
        /// Target absent and not created.
        Missing,
        /// Target is the pass origin.
        Guarded,
    }

    impl HopOutcome {
        /// Whether the target document exists after the hop.
        pub fn reached(self) -> bool {
            matches!(self, Self::Updated | Self::Created | Self::Unchanged)
        }

        pub fn wrote(self) -> bool {
            matches!(self, Self::Updated | Self::Created)
        }

        pub fn name(self) -> &'static str {
            match self {
                Self::Updated => "updated",
                Self::Created => "created",
                Self::Unchanged => "unchanged",
                Self::Missing => "missing",
                Self::Guarded => "guarded",
            }
        }
    }

    impl fmt::Display for HopOutcome {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.pad(self.name())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Hop {
        pub from: RelPath,
        pub to: RelPath,
        pub direction: Direction,
        pub outcome: HopOutcome,
        pub inserted: usize,
        pub retoggled: usize,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct PassReport {
        pub id: PassId,
        pub origin: RelPath,
        pub hops: Vec<Hop>,
    }

    impl PassReport {
        pub fn new(origin: RelPath) -> Self {
            Self {
                id: PassId::new(),
                origin,
                hops: Vec::new(),
            }
        }

        /// Documents created or changed, in pass order.
        pub fn written(&self) -> Vec<&RelPath> {
            let mut out: Vec<&RelPath> = Vec::new();
            for hop in self.hops.iter().filter(|hop| hop.outcome.wrote()) {
                if !out.contains(&&hop.to) {
                    out.push(&hop.to);
                }
            }
            out
        }
    }

    /* ------------------------------- Orchestrator ------------------------------- */

    /// Everything a pass touches outside its own arguments.
    pub struct Context<'a> {
        pub store: &'a mut dyn DocumentStore,
        pub clock: &'a dyn Clock,
        pub config: &'a VaultConfig,
    }

    struct Delivery<'d> {
        edge: Edge,
        from: &'d PeriodKey,
        target: &'d PeriodKey,
        incoming: &'d TaskSet,
        placement: Placement<'d>,
        mode: IdentityMode<'d>,
    }

    pub struct Orchestrator<'a> {
        ctx: Context<'a>,
    }

    impl<'a> Orchestrator<'a> {
        pub fn new(ctx: Context<'a>) -> Self {
            Self { ctx }
        }

        /// Runs the pass for a document the user navigated away from.
        /// Paths outside the planner folders are ignored, and malformed
        /// planner paths are skipped with a warning.
        pub fn on_document_left(&mut self, path: &RelPath) -> Result<Option<PassReport>> {
            match PeriodKey::classify(path, &self.ctx.config.folders) {
                Ok(Some(key)) => self.propagate(&key).map(Some),
                Ok(None) => {
                    tracing::debug!(%path, "not a planner document");
                    Ok(None)
                }
                Err(err @ PlannerError::InvalidPeriodKey { .. }) => {
                    tracing::warn!(%path, error = %err, "skipping document");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        }

        pub fn propagate(&mut self, origin: &PeriodKey) -> Result<PassReport> {
            let mut report = PassReport::new(origin.path(&self.ctx.config.folders));
            let span = tracing::info_span!("pass", id = %report.id, origin = %report.origin);
            let _enter = span.enter();

            for direction in [Direction::Down, Direction::Up] {
                for edge in edges_from(origin.level(), direction) {
                    self.follow(&mut report, edge, origin)?;
                }
            }

            tracing::info!(
                hops = report.hops.len(),
                written = report.written().len(),
                "pass finished"
            );
            Ok(report)
        }

        fn follow(&mut self, report: &mut PassReport, edge: Edge, from: &PeriodKey) -> Result<()> {
            let reached = match (from, edge.to) {
                (PeriodKey::Day(date), Level::Week) => self.day_to_week(report, edge, *date)?,
                (PeriodKey::Week(monday), Level::Month) => self.week_to_month(report, edge, *monday)?,
                (PeriodKey::Month(month), Level::Project) => self.month_to_projects(report, edge, *month)?,
                (PeriodKey::Month(month), Level::Week) => self.month_to_weeks(report, edge, *month)?,
                (PeriodKey::Week(monday), Level::Day) => self.week_to_days(report, edge, *monday)?,
                (PeriodKey::Project(name), Level::Month) => self.project_to_months(report, edge, name)?,
                _ => Vec::new(),
            };
            for target in &reached {
                for next in edges_from(edge.to, edge.direction) {
                    self.follow(report, next, target)?;
                }
            }
            Ok(())
        }

        /* ------------------------------- Hops ------------------------------- */

        fn day_to_week(&mut self, report: &mut PassReport, edge: Edge, date: NaiveDate) -> Result<Vec<PeriodKey>> {
            let source = PeriodKey::day(date);
            let incoming = TaskSet::from_lines(&self.lines_of(&source)?, IdentityMode::Plain);
            let label = SectionLabel::for_day(day_index_in_week(date));
            let target = PeriodKey::week_of(date);
            let outcome = self.deliver(
                report,
                Delivery {
                    edge,
                    from: &source,
                    target: &target,
                    incoming: &incoming,
                    placement: Placement::Section(&label),
                    mode: IdentityMode::Plain,
                },
            )?;
            Ok(outcome.reached().then_some(target).into_iter().collect())
        }

        fn week_to_month(&mut self, report: &mut PassReport, edge: Edge, monday: NaiveDate) -> Result<Vec<PeriodKey>> {
            let source = PeriodKey::Week(monday);
            let incoming = TaskSet::from_lines(&self.lines_of(&source)?, IdentityMode::Plain);
            let label = SectionLabel::for_week(week_index_in_month(monday));
            let target = PeriodKey::month_of(monday);
            let outcome = self.deliver(
                report,
                Delivery {
                    edge,
                    from: &source,
                    target: &target,
                    incoming: &incoming,
                    placement: Placement::Section(&label),
                    mode: IdentityMode::Plain,
                },
            )?;
            Ok(outcome.reached().then_some(target).into_iter().collect())
        }

        /// Month tasks carrying a project reference go to that project, with
        /// the reference removed.
        fn month_to_projects(&mut self, report: &mut PassReport, edge: Edge, month: Month) -> Result<Vec<PeriodKey>> {
            let config = self.ctx.config;
            let folder = config.folders.project.as_str();
            let source = PeriodKey::Month(month);

            let mut buckets: IndexMap<String, TaskSet> = IndexMap::new();
            for line in self.lines_of(&source)? {
                let Some((stripped, reference)) = strip_project_ref(line.trim(), folder) else {
                    continue;
                };
                if let Some(task) = Task::parse(&stripped) {
                    buckets.entry(reference.project()).or_default().insert(task);
                }
            }

            let mut reached = Vec::new();
            for (name, incoming) in &buckets {
                let target = match PeriodKey::parse_identifier(Level::Project, name) {
                    Ok(key) => key,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping project reference");
                        continue;
                    }
                };
                let outcome = self.deliver(
                    report,
                    Delivery {
                        edge,
                        from: &source,
                        target: &target,
                        incoming,
                        placement: Placement::Document,
                        mode: IdentityMode::ProjectAware {
                            folder,
                            project: name.as_str(),
                        },
                    },
                )?;
                if outcome.reached() {
                    reached.push(target);
                }
            }
            Ok(reached)
        }

        fn month_to_weeks(&mut self, report: &mut PassReport, edge: Edge, month: Month) -> Result<Vec<PeriodKey>> {
            let source = PeriodKey::Month(month);
            let lines = self.lines_of(&source)?;
            let mut reached = Vec::new();
            for (idx, monday) in month.weeks().into_iter().enumerate() {
                let incoming = section_tasks(&lines, &SectionLabel::for_week(idx as u32), IdentityMode::Plain);
                let target = PeriodKey::Week(monday);
                let outcome = self.deliver(
                    report,
                    Delivery {
                        edge,
                        from: &source,
                        target: &target,
                        incoming: &incoming,
                        placement: Placement::Document,
                        mode: IdentityMode::Plain,
                    },
                )?;
                if outcome.reached() {
                    reached.push(target);
                }
            }
            Ok(reached)
        }

        fn week_to_days(&mut self, report: &mut PassReport, edge: Edge, monday: NaiveDate) -> Result<Vec<PeriodKey>> {
            let source = PeriodKey::Week(monday);
            let lines = self.lines_of(&source)?;
            let mut reached = Vec::new();
            for offset in 0..7u32 {
                let incoming = section_tasks(&lines, &SectionLabel::for_day(offset), IdentityMode::Plain);
                let target = PeriodKey::day(add_days(monday, i64::from(offset)));
                let outcome = self.deliver(
                    report,
                    Delivery {
                        edge,
                        from: &source,
                        target: &target,
                        incoming: &incoming,
                        placement: Placement::Document,
                        mode: IdentityMode::Plain,
                    },
                )?;
                if outcome.reached() {
                    reached.push(target);
                }
            }
            Ok(reached)
        }

        /// Catch-up. Project tasks re-tick the months from the current one on;
        /// tasks none of those months hold are inserted into the current
        /// week's section of the current month. A month line only matches when
        /// it refers to this project or to no project at all. Only months that changed
        /// continue down the hierarchy.
        fn project_to_months(&mut self, report: &mut PassReport, edge: Edge, name: &str) -> Result<Vec<PeriodKey>> {
            let config = self.ctx.config;
            let mode = IdentityMode::ProjectAware {
                folder: config.folders.project.as_str(),
                project: name,
            };
            let source = PeriodKey::project(name);
            let tasks = self.project_tasks(name)?;
            if tasks.is_empty() {
                return Ok(Vec::new());
            }

            let today = self.ctx.clock.today();
            let current = Month::owning(today);
            let mut months = vec![current];
            for path in self.ctx.store.list_all()? {
                if let Ok(Some(PeriodKey::Month(month))) = PeriodKey::classify(&path, &config.folders) {
                    if month > current {
                        months.push(month);
                    }
                }
            }
            months.sort();

            let mut present = Vec::with_capacity(months.len());
            for month in &months {
                let lines = self.lines_of(&PeriodKey::Month(*month))?;
                present.push(TaskSet::from_lines(&lines, mode));
            }
            let scheduled = |identity: &str| present.iter().any(|found| found.contains(identity));

            let label = SectionLabel::for_week(week_index_in_month(today));
            let mut reached = Vec::new();
            for (month, found) in months.iter().zip(&present) {
                let incoming: TaskSet = tasks
                    .iter()
                    .filter(|task| {
                        found.contains(&task.identity) || (*month == current && !scheduled(task.identity.as_str()))
                    })
                    .cloned()
                    .collect();
                let target = PeriodKey::Month(*month);
                let outcome = self.deliver(
                    report,
                    Delivery {
                        edge,
                        from: &source,
                        target: &target,
                        incoming: &incoming,
                        placement: Placement::Section(&label),
                        mode,
                    },
                )?;
                if outcome.wrote() {
                    reached.push(target);
                }
            }
            Ok(reached)
        }

        /* ---------------------------- Delivery ---------------------------- */

        fn deliver(&mut self, report: &mut PassReport, delivery: Delivery<'_>) -> Result<HopOutcome> {
            let config = self.ctx.config;
            let folders = &config.folders;
            let Delivery {
                edge,
                from,
                target,
                incoming,
                placement,
                mode,
            } = delivery;
            let path = target.path(folders);
            let mut hop = Hop {
                from: from.path(folders),
                to: path.clone(),
                direction: edge.direction,
                outcome: HopOutcome::Unchanged,
                inserted: 0,
                retoggled: 0,
            };

            if path == report.origin {
                tracing::warn!(%path, %edge, "refusing to write the pass origin");
                hop.outcome = HopOutcome::Guarded;
            } else if let Some((doc, created)) = self.open_target(target, &path, incoming)? {
                let merge = Reconciler::for_level(target.level(), mode).merge(&doc.lines, incoming, placement);
                if merge.changed() {
                    self.ctx.store.write(&doc.handle, &merge.lines.join("\n"))?;
                }
                hop.inserted = merge.inserted.len();
                hop.retoggled = merge.retoggled;
                hop.outcome = if created {
                    HopOutcome::Created
                } else if merge.changed() {
                    HopOutcome::Updated
                } else {
                    HopOutcome::Unchanged
                };
            } else {
                hop.outcome = HopOutcome::Missing;
            }

            tracing::debug!(
                %edge,
                to = %hop.to,
                outcome = %hop.outcome,
                inserted = hop.inserted,
                retoggled = hop.retoggled,
                "hop"
            );
            let outcome = hop.outcome;
            report.hops.push(hop);
            Ok(outcome)
        }

        /// Existing target, or one created from its template when the level's
        /// policy allows it and there is something to put in it.
        fn open_target(
            &mut self,
            key: &PeriodKey,
            path: &RelPath,
            incoming: &TaskSet,
        ) -> Result<Option<(Document, bool)>> {
            if let Some(doc) = Document::load(&*self.ctx.store, path)? {
                return Ok(Some((doc, false)));
            }
            let config = self.ctx.config;
            if incoming.is_empty() || !config.create.creates(key.level()) {
                return Ok(None);
            }
            let text = template::for_key(key, &config.folders);
            let handle = self.ctx.store.create(path, &text)?;
            tracing::debug!(%path, "created from template");
            Ok(Some((Document::new(handle, &text), true)))
        }

        fn lines_of(&self, key: &PeriodKey) -> Result<Vec<String>> {
            let path = key.path(&self.ctx.config.folders);
            match Document::load(&*self.ctx.store, &path)? {
                Some(doc) => Ok(doc.lines),
                None => {
                    tracing::debug!(%path, "document missing, no tasks");
                    Ok(Vec::new())
                }
            }
        }

        /* ---------------------------- Queries ---------------------------- */

        /// Tasks of a project document as they appear elsewhere: each one
        /// carries a reference back to the project.
        pub fn project_tasks(&self, name: &str) -> Result<TaskSet> {
            let config = self.ctx.config;
            let folder = config.folders.project.as_str();
            let canonical = ProjectRef::canonical(name, config.projects.reference, folder);
            let lines = self.lines_of(&PeriodKey::project(name))?;
            Ok(lines
                .iter()
                .filter_map(|line| {
                    let line = line.trim();
                    let owned = matches!(
                        strip_project_ref(line, folder),
                        Some((_, reference)) if reference.project() == name
                    );
                    let line = if owned {
                        line.to_string()
                    } else {
                        format!("{line} {canonical}")
                    };
                    Task::parse_with(
                        &line,
                        IdentityMode::ProjectAware {
                            folder,
                            project: name,
                        },
                    )
                })
                .collect())
        }

        /* ---------------------------- Lifecycle ---------------------------- */

        /// Writes the template into an empty day, week or month document.
        pub fn fill_if_empty(&mut self, path: &RelPath) -> Result<bool> {
            let config = self.ctx.config;
            let key = match PeriodKey::classify(path, &config.folders) {
                Ok(Some(key)) if key.level() != Level::Project => key,
                Ok(_) => return Ok(false),
                Err(err) => {
                    tracing::warn!(%path, error = %err, "not filling document");
                    return Ok(false);
                }
            };
            let Some(doc) = Document::load(&*self.ctx.store, path)? else {
                return Ok(false);
            };
            if !doc.text().trim().is_empty() {
                return Ok(false);
            }
            self.ctx.store.write(&doc.handle, &template::for_key(&key, &config.folders))?;
            tracing::info!(%path, "filled from template");
            Ok(true)
        }

        /// Creates today's day, week and month documents and tomorrow's week
        /// and month documents if they are missing.
        pub fn bootstrap(&mut self) -> Result<Vec<RelPath>> {
            let config = self.ctx.config;
            let today = self.ctx.clock.today();
            let tomorrow = add_days(today, 1);
            let keys = [
                PeriodKey::day(today),
                PeriodKey::week_of(today),
                PeriodKey::month_of(today),
                PeriodKey::week_of(tomorrow),
                PeriodKey::month_of(tomorrow),
            ];

            let mut created = Vec::new();
            for key in keys {
                let path = key.path(&config.folders);
                if created.contains(&path) || self.ctx.store.exists(&path) {
                    continue;
                }
                self.ctx.store.create(&path, &template::for_key(&key, &config.folders))?;
                tracing::info!(%path, "created");
                created.push(path);
            }
            Ok(created)
        }
    }

}
