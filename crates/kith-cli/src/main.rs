use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kith_core::{
    canonical_day, parse_day, recommendations, render_message, year_plan, Contact, SchedulePolicy,
};
use kith_store_fs::{generate_salt, KithDir, MailerSettings};
use serde_json::Value;
use time::{Date, OffsetDateTime};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "kith")]
#[command(about = "Deterministic keep-in-touch reminders", version)]
struct Cli {
    #[arg(long, global = true, help = "App directory (default: ~/.kith)")]
    dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = PolicyArg::EvenSplit)]
    policy: PolicyArg,

    #[arg(long, global = true, default_value_t = false, help = "Emit machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum PolicyArg {
    EvenSplit,
    PeriodicBucket,
}

impl PolicyArg {
    fn into_policy(self) -> SchedulePolicy {
        match self {
            Self::EvenSplit => SchedulePolicy::EvenSplit,
            Self::PeriodicBucket => SchedulePolicy::PeriodicBucket,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add one contact with a freshly generated salt
    Add(AddArgs),
    /// Add many contacts from a file, one name per line
    BatchAdd(BatchAddArgs),
    /// List stored contacts
    List,
    /// Remove a stored contact
    Remove(RemoveArgs),
    /// Print today's recommendations without sending anything
    DryRecs(DayArgs),
    /// Compute today's recommendations and email them
    Recs(DayArgs),
    /// Show the whole year's emailing days and selections
    Plan(PlanArgs),
    /// Find the next emailing day on or after a date
    NextDay(DayArgs),
    /// Store mail transport settings
    Setup(SetupArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct BatchAddArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct DayArgs {
    #[arg(long, help = "YYYY-MM-DD; defaults to today")]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long, help = "Defaults to the current year")]
    year: Option<i32>,
}

#[derive(Debug, Args)]
struct SetupArgs {
    #[arg(long)]
    domain: String,
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    dest_email: String,
    #[arg(long, default_value = "https://api.mailgun.net/v3")]
    api_base: String,
    #[arg(long, default_value = "kith")]
    from_name: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let policy = cli.policy.into_policy();
    let dir = KithDir::open(cli.dir.clone())?;
    let out = Output { json: cli.json };
    match cli.command {
        Command::Add(args) => run_add(&args, &dir, &out),
        Command::BatchAdd(args) => run_batch_add(&args, &dir, &out),
        Command::List => run_list(&dir, &out),
        Command::Remove(args) => run_remove(&args, &dir, &out),
        Command::DryRecs(args) => run_recs(&args, &dir, policy, &out, false),
        Command::Recs(args) => run_recs(&args, &dir, policy, &out, true),
        Command::Plan(args) => run_plan(&args, &dir, policy, &out),
        Command::NextDay(args) => run_next_day(&args, policy, &out),
        Command::Setup(args) => run_setup(&args, &dir, &out),
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, human: &str, payload: Value) -> Result<()> {
        if self.json {
            let wrapped = with_contract_version(payload);
            println!("{}", serde_json::to_string_pretty(&wrapped)?);
        } else {
            println!("{human}");
        }
        Ok(())
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn today() -> Date {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()).date()
}

fn resolve_day(arg: Option<&str>) -> Result<Date> {
    match arg {
        Some(raw) => Ok(parse_day(raw)?),
        None => Ok(today()),
    }
}

fn run_add(args: &AddArgs, dir: &KithDir, out: &Output) -> Result<()> {
    if dir.load_contact(&args.name)?.is_some() {
        // An existing salt must never be regenerated; it would silently
        // move the contact to a different schedule slot.
        return Err(anyhow!("contact {:?} already exists", args.name));
    }
    let contact = Contact::new(args.name.clone(), generate_salt())?;
    dir.save_contact(&contact)?;
    out.emit(
        &format!("Added {}.", contact.name),
        serde_json::json!({
            "added": contact.name,
            "salt": contact.salt,
        }),
    )
}

fn run_batch_add(args: &BatchAddArgs, dir: &KithDir, out: &Output) -> Result<()> {
    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read batch file {}", args.file.display()))?;
    let mut added = Vec::new();
    let mut skipped = Vec::new();
    for line in body.lines() {
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        if dir.load_contact(name)?.is_some() {
            skipped.push(name.to_string());
            continue;
        }
        // A fresh salt per line, otherwise everyone would share a slot.
        let contact = Contact::new(name, generate_salt())?;
        dir.save_contact(&contact)?;
        added.push(contact.name);
    }
    out.emit(
        &format!("Added {} contacts, skipped {} existing.", added.len(), skipped.len()),
        serde_json::json!({
            "added": added,
            "skipped_existing": skipped,
        }),
    )
}

fn run_list(dir: &KithDir, out: &Output) -> Result<()> {
    let contacts = dir.load_contacts()?;
    let names: Vec<&str> = contacts.iter().map(|contact| contact.name.as_str()).collect();
    let human = if names.is_empty() {
        "No contacts stored.".to_string()
    } else {
        names.join("\n")
    };
    out.emit(
        &human,
        serde_json::json!({
            "count": names.len(),
            "contacts": names,
        }),
    )
}

fn run_remove(args: &RemoveArgs, dir: &KithDir, out: &Output) -> Result<()> {
    dir.remove_contact(&args.name)?;
    out.emit(
        &format!("Removed {}.", args.name),
        serde_json::json!({
            "removed": args.name,
        }),
    )
}

fn run_recs(
    args: &DayArgs,
    dir: &KithDir,
    policy: SchedulePolicy,
    out: &Output,
    send: bool,
) -> Result<()> {
    let date = resolve_day(args.date.as_deref())?;
    let contacts = dir.load_contacts()?;
    let recs = recommendations(&contacts, policy, date)?;
    let next = policy.next_emailing_day(date)?;
    let message = render_message(recs.as_deref(), next);

    if send {
        let settings = dir
            .load_settings()?
            .ok_or_else(|| anyhow!("mailer settings missing; run `kith setup` first"))?;
        let subject = format!("kith | {}", canonical_day(date));
        send_via_mailer(&settings, &subject, &message)?;
    }

    let selected: Option<Vec<&str>> = recs
        .as_ref()
        .map(|chosen| chosen.iter().map(|contact| contact.name.as_str()).collect());
    let human = if send { format!("{message}\n\nRecommendations sent by email.") } else { message.clone() };
    out.emit(
        &human,
        serde_json::json!({
            "date": canonical_day(date),
            "policy": policy.as_str(),
            "emailing_day": recs.is_some(),
            "selected": selected,
            "next_emailing_day": canonical_day(next),
            "message": message,
            "sent": send,
        }),
    )
}

fn run_plan(args: &PlanArgs, dir: &KithDir, policy: SchedulePolicy, out: &Output) -> Result<()> {
    let year = args.year.unwrap_or_else(|| today().year());
    let contacts = dir.load_contacts()?;
    let plan = year_plan(&contacts, policy, year)?;

    let mut emailing_days = Vec::new();
    let mut human_lines = Vec::new();
    for entry in &plan {
        let Some(selected) = entry.recommendations.as_ref() else {
            continue;
        };
        let names: Vec<&str> = selected.iter().map(|contact| contact.name.as_str()).collect();
        human_lines.push(if names.is_empty() {
            format!("{}: (nobody)", canonical_day(entry.date))
        } else {
            format!("{}: {}", canonical_day(entry.date), names.join(", "))
        });
        emailing_days.push(serde_json::json!({
            "date": canonical_day(entry.date),
            "selected": names,
        }));
    }
    out.emit(
        &human_lines.join("\n"),
        serde_json::json!({
            "year": year,
            "policy": policy.as_str(),
            "days_in_year": plan.len(),
            "emailing_day_count": emailing_days.len(),
            "emailing_days": emailing_days,
        }),
    )
}

fn run_next_day(args: &DayArgs, policy: SchedulePolicy, out: &Output) -> Result<()> {
    let date = resolve_day(args.date.as_deref())?;
    let next = policy.next_emailing_day(date)?;
    out.emit(
        &format!("Next emailing day is {}.", canonical_day(next)),
        serde_json::json!({
            "from": canonical_day(date),
            "policy": policy.as_str(),
            "next_emailing_day": canonical_day(next),
        }),
    )
}

fn run_setup(args: &SetupArgs, dir: &KithDir, out: &Output) -> Result<()> {
    let settings = MailerSettings {
        api_base: args.api_base.clone(),
        domain: args.domain.clone(),
        api_key: args.api_key.clone(),
        from_name: args.from_name.clone(),
        dest_email: args.dest_email.clone(),
    };
    dir.save_settings(&settings)?;
    out.emit(
        &format!("Settings saved to {}.", dir.root().display()),
        serde_json::json!({
            "settings_dir": dir.root().display().to_string(),
            "domain": settings.domain,
            "dest_email": settings.dest_email,
        }),
    )
}

fn send_via_mailer(settings: &MailerSettings, subject: &str, body: &str) -> Result<()> {
    let url = format!("{}/{}/messages", settings.api_base.trim_end_matches('/'), settings.domain);
    let credentials = BASE64_STANDARD.encode(format!("api:{}", settings.api_key));
    let from = format!("{} <mailer@{}>", settings.from_name, settings.domain);
    ureq::post(&url)
        .set("Authorization", &format!("Basic {credentials}"))
        .send_form(&[
            ("from", from.as_str()),
            ("to", settings.dest_email.as_str()),
            ("subject", subject),
            ("text", body),
        ])
        .map_err(|err| anyhow!("mail transport request failed: {err}"))?;
    Ok(())
}
