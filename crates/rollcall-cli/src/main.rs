use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_store::{
    enroll_student, remove_student, revise_student, Config, EmbeddingBuilder, EmbeddingStore, NewStudent, NewTeacher,
    SessionController, Store, StudentUpdate, TeacherUpdate,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration", version)]
struct Cli {
    /// TOML configuration file (overrides $ROLLCALL_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage classrooms
    #[command(subcommand)]
    Classroom(ClassroomCmd),
    /// Manage students and their photos
    #[command(subcommand)]
    Student(StudentCmd),
    /// Manage teachers
    #[command(subcommand)]
    Teacher(TeacherCmd),
    /// Rebuild stored face embeddings
    #[command(subcommand)]
    Encodings(EncodingsCmd),
    /// Attendance reports
    #[command(subcommand)]
    Report(ReportCmd),
}

#[derive(Subcommand)]
enum ClassroomCmd {
    Add { name: String },
    List,
    Rename { id: i64, name: String },
    /// Delete a classroom with its students and sessions
    Rm { id: i64 },
}

#[derive(Args)]
struct StudentFields {
    #[arg(long)]
    roll_no: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    classroom: Option<i64>,
    /// Image file to copy into the media root
    #[arg(long)]
    photo: Option<PathBuf>,
}

#[derive(Subcommand)]
enum StudentCmd {
    Add {
        #[arg(long)]
        roll_no: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        classroom: i64,
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    Update {
        id: i64,
        #[command(flatten)]
        fields: StudentFields,
    },
    List {
        #[arg(long)]
        classroom: Option<i64>,
    },
    Rm { id: i64 },
}

#[derive(Subcommand)]
enum TeacherCmd {
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        employee_id: String,
        #[arg(long)]
        department: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        qualification: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        employee_id: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        qualification: Option<String>,
    },
    List,
    Rm { id: i64 },
}

#[derive(Subcommand)]
enum EncodingsCmd {
    /// Rebuild embeddings for every student with a photo, or just one
    Rebuild {
        #[arg(long)]
        student: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ReportCmd {
    List,
    Show { session_id: i64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let store = Store::open(&config.db_path)?;

    match cli.command {
        Commands::Classroom(cmd) => classroom(&store, cmd),
        Commands::Student(cmd) => student(&config, &store, cmd),
        Commands::Teacher(cmd) => teacher(&store, cmd),
        Commands::Encodings(EncodingsCmd::Rebuild { student }) => rebuild(&config, &store, student),
        Commands::Report(cmd) => report(&store, cmd),
    }
}

fn classroom(store: &Store, cmd: ClassroomCmd) -> Result<()> {
    match cmd {
        ClassroomCmd::Add { name } => {
            let room = store.create_classroom(&name)?;
            println!("created classroom {} ({})", room.id, room.name);
        }
        ClassroomCmd::List => {
            for room in store.list_classrooms()? {
                println!("{:>4}  {}", room.id, room.name);
            }
        }
        ClassroomCmd::Rename { id, name } => {
            store.rename_classroom(id, &name)?;
            println!("renamed classroom {id} to {name}");
        }
        ClassroomCmd::Rm { id } => {
            store.delete_classroom(id)?;
            println!("deleted classroom {id}");
        }
    }
    Ok(())
}

fn embedding_store(config: &Config) -> EmbeddingStore {
    EmbeddingStore::new(config.encodings_dir(), config.recognition.model_name.clone())
}

fn builder(config: &Config) -> Result<EmbeddingBuilder> {
    let engine = config.load_engine().context("loading face models")?;
    Ok(EmbeddingBuilder::new(Arc::new(Mutex::new(engine)), embedding_store(config), &config.media_root))
}

/// A builder for saves that carry a photo. Model load failures only cost
/// the embedding, never the save.
fn photo_builder(config: &Config, has_photo: bool) -> Option<EmbeddingBuilder> {
    if !has_photo {
        return None;
    }
    match builder(config) {
        Ok(builder) => Some(builder),
        Err(error) => {
            tracing::warn!(error = %format!("{error:#}"), "face models unavailable; saving without embedding");
            None
        }
    }
}

fn student(config: &Config, store: &Store, cmd: StudentCmd) -> Result<()> {
    match cmd {
        StudentCmd::Add { roll_no, name, classroom, photo } => {
            let new = NewStudent { roll_no, name, classroom_id: classroom, photo: None };
            let builder = photo_builder(config, photo.is_some());
            let student = enroll_student(store, builder.as_ref(), &config.media_root, &new, photo.as_deref())?;
            println!("created student {} ({})", student.id, student.roll_no);
        }
        StudentCmd::Update { id, fields } => {
            let update = StudentUpdate {
                roll_no: fields.roll_no,
                name: fields.name,
                classroom_id: fields.classroom,
                photo: None,
            };
            let builder = photo_builder(config, fields.photo.is_some());
            let student =
                revise_student(store, builder.as_ref(), &config.media_root, id, &update, fields.photo.as_deref())?;
            println!("updated student {} ({})", student.id, student.roll_no);
        }
        StudentCmd::List { classroom } => {
            let students = match classroom {
                Some(id) => store.list_students_in_classroom(id)?,
                None => store.list_students()?,
            };
            let embeddings = embedding_store(config);
            for s in students {
                let enrolled = if embeddings.path_for(s.id).exists() { "yes" } else { "no" };
                println!("{:>4}  {:<12} {:<24} classroom={} embedding={}", s.id, s.roll_no, s.name, s.classroom_id, enrolled);
            }
        }
        StudentCmd::Rm { id } => {
            remove_student(store, &embedding_store(config), id)?;
            println!("deleted student {id}");
        }
    }
    Ok(())
}

fn teacher(store: &Store, cmd: TeacherCmd) -> Result<()> {
    match cmd {
        TeacherCmd::Add { username, employee_id, department, phone, qualification } => {
            let t = store.create_teacher(&NewTeacher { username, employee_id, department, phone, qualification })?;
            println!("created teacher {} ({})", t.id, t.username);
        }
        TeacherCmd::Update { id, username, employee_id, department, phone, qualification } => {
            let update = TeacherUpdate { username, employee_id, department, phone, qualification };
            let t = store.update_teacher(id, &update)?;
            println!("updated teacher {} ({})", t.id, t.username);
        }
        TeacherCmd::List => {
            for t in store.list_teachers()? {
                println!("{:>4}  {:<16} {:<10} {}", t.id, t.username, t.employee_id, t.department);
            }
        }
        TeacherCmd::Rm { id } => {
            store.delete_teacher(id)?;
            println!("deleted teacher {id}");
        }
    }
    Ok(())
}

fn rebuild(config: &Config, store: &Store, only: Option<i64>) -> Result<()> {
    let students = match only {
        Some(id) => vec![store.get_student(id)?],
        None => store.list_students()?.into_iter().filter(|s| s.photo.is_some()).collect(),
    };
    let builder = builder(config)?;

    let mut failed = 0;
    for s in &students {
        match builder.build(s) {
            Ok(path) => println!("{:<12} -> {}", s.roll_no, path.display()),
            Err(error) => {
                failed += 1;
                println!("{:<12} failed: {error}", s.roll_no);
            }
        }
    }
    println!("{} rebuilt, {failed} failed", students.len() - failed);
    if only.is_some() && failed > 0 {
        bail!("embedding rebuild failed");
    }
    Ok(())
}

fn report(store: &Store, cmd: ReportCmd) -> Result<()> {
    let controller = SessionController::new(store.clone());
    match cmd {
        ReportCmd::List => {
            for s in controller.session_summaries()? {
                let end = s.end_time.map(|t| t.format("%H:%M").to_string()).unwrap_or_else(|| "open".into());
                println!(
                    "{:>4}  {}  {}-{:<5}  {:<12} by {:<12} present={} absent={}",
                    s.id,
                    s.date,
                    s.start_time.format("%H:%M"),
                    end,
                    s.classroom,
                    s.taken_by,
                    s.present,
                    s.absent
                );
            }
        }
        ReportCmd::Show { session_id } => {
            let detail = controller.session_detail(session_id)?;
            println!(
                "session {} | {} | {} | taken by {}",
                detail.session.id, detail.classroom, detail.session.date, detail.session.taken_by
            );
            println!("present {} / absent {}", detail.present, detail.absent);
            for r in &detail.records {
                println!("  {:<12} {:<24} {}", r.roll_no, r.name, r.status);
            }
        }
    }
    Ok(())
}
